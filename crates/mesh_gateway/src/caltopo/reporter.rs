use crate::caltopo::{CalTopoReporterConfig, RetryPolicy, CALTOPO_DOMAIN};
use async_trait::async_trait;
use common::domain::{
    is_valid_identifier, redact_identifiers, DomainError, DomainResult, PositionReport,
    PositionReporter, REDACTED,
};
use reqwest::{Client, StatusCode};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

/// One configured report target
#[derive(Clone, PartialEq, Eq)]
pub enum Destination {
    /// Per-operator connect key
    ConnectKey(String),
    /// Shared team group id
    Group(String),
}

impl Destination {
    pub fn kind(&self) -> &'static str {
        match self {
            Destination::ConnectKey(_) => "connect_key",
            Destination::Group(_) => "group",
        }
    }

    fn identifier(&self) -> &str {
        match self {
            Destination::ConnectKey(id) | Destination::Group(id) => id,
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), REDACTED)
    }
}

/// Result of a single HTTP attempt
enum AttemptOutcome {
    Delivered,
    Retryable(String),
    Fatal(String),
    Cancelled,
}

/// Delivers positions to the CalTopo position report API.
///
/// Each configured destination gets `GET <base>/<identifier>?id=&lat=&lng=`
/// with its own retry budget; destinations are delivered concurrently.
pub struct CalTopoReporter {
    client: Client,
    base_url: Url,
    connect_key: Option<String>,
    group: Option<String>,
    retry: RetryPolicy,
    shutdown_token: CancellationToken,
}

impl CalTopoReporter {
    /// Fails if the base URL is not on the CalTopo domain and does not
    /// match one of the configured test URL prefixes.
    pub fn new(
        config: CalTopoReporterConfig,
        shutdown_token: CancellationToken,
    ) -> DomainResult<Self> {
        let base_url = validate_base_url(&config.base_url, &config.allowed_test_urls)?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                DomainError::InvalidConfiguration(format!("failed to build HTTP client: {}", e))
            })?;

        let reporter = Self {
            client,
            base_url,
            connect_key: config.connect_key,
            group: config.group,
            retry: config.retry,
            shutdown_token,
        };

        info!(
            base_url = %reporter.base_url,
            connect_key_configured = reporter.connect_key.is_some(),
            group_configured = reporter.group.is_some(),
            max_attempts = reporter.retry.max_attempts(),
            "CalTopo reporter initialized"
        );
        Ok(reporter)
    }

    /// Destinations for a report; `group_override` replaces the configured group
    pub fn destinations(&self, group_override: Option<&str>) -> Vec<Destination> {
        let group = group_override.or(self.group.as_deref());
        self.connect_key
            .iter()
            .map(|key| Destination::ConnectKey(key.clone()))
            .chain(group.map(|group| Destination::Group(group.to_string())))
            .collect()
    }

    /// Probe the first destination with a dummy report.
    ///
    /// Any HTTP response counts as reachable.
    pub async fn test_connection(&self) -> bool {
        let Some(destination) = self.destinations(None).into_iter().next() else {
            warn!("no CalTopo destination configured, skipping connectivity test");
            return false;
        };
        if !is_valid_identifier(destination.identifier()) {
            warn!(destination = destination.kind(), "invalid destination identifier");
            return false;
        }

        let url = self.endpoint(&destination);
        let request = self
            .client
            .get(url)
            .query(&[("id", "TEST"), ("lat", "0"), ("lng", "0")]);

        match request.send().await {
            Ok(response) => {
                info!(
                    status = response.status().as_u16(),
                    "CalTopo API connectivity test successful"
                );
                true
            }
            Err(e) => {
                warn!(
                    error = %self.redact(&e.without_url().to_string()),
                    "CalTopo API connectivity test failed"
                );
                false
            }
        }
    }

    #[instrument(skip_all, fields(destination = destination.kind()))]
    async fn deliver(&self, destination: &Destination, report: &PositionReport) -> bool {
        if !is_valid_identifier(destination.identifier()) {
            error!(
                identifier = REDACTED,
                "rejecting destination identifier with invalid characters"
            );
            return false;
        }

        let max_attempts = self.retry.max_attempts();
        for attempt in 0..max_attempts {
            match self.attempt(destination, report).await {
                AttemptOutcome::Delivered => {
                    debug!(attempt = attempt + 1, "position delivered");
                    return true;
                }
                AttemptOutcome::Fatal(reason) => {
                    error!(reason = %reason, "position rejected, not retrying");
                    return false;
                }
                AttemptOutcome::Cancelled => {
                    debug!("delivery cancelled");
                    return false;
                }
                AttemptOutcome::Retryable(reason) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = max_attempts,
                        reason = %reason,
                        "position delivery failed"
                    );
                }
            }

            if attempt + 1 < max_attempts {
                tokio::select! {
                    _ = self.shutdown_token.cancelled() => {
                        debug!("delivery cancelled during backoff");
                        return false;
                    }
                    _ = tokio::time::sleep(self.retry.delay_for(attempt)) => {}
                }
            }
        }

        error!(attempts = max_attempts, "giving up on position delivery");
        false
    }

    async fn deliver_if_configured(
        &self,
        destination: Option<&Destination>,
        report: &PositionReport,
    ) -> bool {
        match destination {
            Some(destination) => self.deliver(destination, report).await,
            None => false,
        }
    }

    async fn attempt(&self, destination: &Destination, report: &PositionReport) -> AttemptOutcome {
        let request = self.client.get(self.endpoint(destination)).query(&[
            ("id", report.label.clone()),
            ("lat", report.latitude.to_string()),
            ("lng", report.longitude.to_string()),
        ]);

        let response = tokio::select! {
            _ = self.shutdown_token.cancelled() => return AttemptOutcome::Cancelled,
            response = request.send() => response,
        };

        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    AttemptOutcome::Delivered
                } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    AttemptOutcome::Retryable(format!("HTTP {}", status.as_u16()))
                } else {
                    AttemptOutcome::Fatal(format!("HTTP {}", status.as_u16()))
                }
            }
            Err(e) => AttemptOutcome::Retryable(self.redact(&e.without_url().to_string())),
        }
    }

    fn endpoint(&self, destination: &Destination) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            destination.identifier()
        )
    }

    fn redact(&self, text: &str) -> String {
        let secrets: Vec<&str> = self
            .connect_key
            .iter()
            .chain(self.group.iter())
            .map(String::as_str)
            .collect();
        redact_identifiers(text, &secrets)
    }
}

#[async_trait]
impl PositionReporter for CalTopoReporter {
    async fn report(&self, report: &PositionReport) -> bool {
        let destinations = self.destinations(report.group.as_deref());
        if destinations.is_empty() {
            warn!("no CalTopo destination configured, position not sent");
            return false;
        }

        let (first, second) = match destinations.as_slice() {
            [only] => (Some(only), None),
            [first, second, ..] => (Some(first), Some(second)),
            [] => (None, None),
        };

        let (first_ok, second_ok) = tokio::join!(
            self.deliver_if_configured(first, report),
            self.deliver_if_configured(second, report)
        );
        first_ok || second_ok
    }
}

/// Accept `base_url` only if it is an https URL on the CalTopo domain, or
/// falls under one of `allowed_test_urls`. URLs carrying credentials are
/// always refused.
fn validate_base_url(base_url: &str, allowed_test_urls: &[String]) -> DomainResult<Url> {
    let url = Url::parse(base_url).map_err(|e| {
        DomainError::InvalidConfiguration(format!("invalid CalTopo base URL: {}", e))
    })?;
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();

    if !url.username().is_empty() || url.password().is_some() {
        return Err(DomainError::InsecureBaseUrl(host));
    }

    if allowed_test_urls
        .iter()
        .any(|allowed| allow_list_covers(allowed, &url))
    {
        warn!(base_url = %url, "using CalTopo base URL from test allow-list");
        return Ok(url);
    }

    let on_domain = host == CALTOPO_DOMAIN || host.ends_with(&format!(".{}", CALTOPO_DOMAIN));
    if url.scheme() != "https" || !on_domain {
        return Err(DomainError::InsecureBaseUrl(host));
    }
    Ok(url)
}

/// Same scheme, host and effective port as `allowed`, and a path under its path
fn allow_list_covers(allowed: &str, url: &Url) -> bool {
    let allowed = match Url::parse(allowed) {
        Ok(allowed) => allowed,
        Err(e) => {
            warn!(entry = %allowed, error = %e, "ignoring unparseable test allow-list entry");
            return false;
        }
    };

    allowed.scheme() == url.scheme()
        && allowed.host_str().is_some()
        && allowed.host_str() == url.host_str()
        && allowed.port_or_known_default() == url.port_or_known_default()
        && url.path().starts_with(allowed.path())
}
