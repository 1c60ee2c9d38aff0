/// Placeholder written in place of secret identifiers
pub const REDACTED: &str = "<REDACTED>";

/// Escape line breaks so untrusted input cannot forge log lines
pub fn sanitize_for_log(input: &str) -> String {
    input.replace('\n', "\\n").replace('\r', "\\r")
}

/// Destination identifiers may only contain ASCII letters, digits and `_`
pub fn is_valid_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replace every occurrence of each secret in `text` with [`REDACTED`]
pub fn redact_identifiers(text: &str, secrets: &[&str]) -> String {
    secrets
        .iter()
        .filter(|secret| !secret.is_empty())
        .fold(text.to_string(), |acc, secret| acc.replace(secret, REDACTED))
}
