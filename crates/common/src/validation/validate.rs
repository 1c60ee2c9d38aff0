//! Struct validation helpers built on garde.

use crate::domain::{is_valid_identifier, DomainError};
use garde::{Report, Validate};

/// Validate a struct, flattening the garde report into a `DomainError`
pub fn validate_struct<T>(value: &T) -> Result<(), DomainError>
where
    T: Validate,
    T::Context: Default,
{
    value
        .validate()
        .map_err(|report| DomainError::ValidationError(format_validation_errors(&report)))
}

/// Custom garde rule for CalTopo connect keys and group ids.
///
/// The identifier value itself never appears in the error message.
pub fn caltopo_identifier(value: &Option<String>, _ctx: &()) -> garde::Result {
    match value.as_deref() {
        None => Ok(()),
        Some(id) if is_valid_identifier(id) => Ok(()),
        Some(_) => Err(garde::Error::new(
            "must contain only letters, digits and underscores",
        )),
    }
}

fn format_validation_errors(report: &Report) -> String {
    report
        .iter()
        .map(|(path, error)| {
            if path.to_string().is_empty() {
                error.message().to_string()
            } else {
                format!("{}: {}", path, error.message())
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
