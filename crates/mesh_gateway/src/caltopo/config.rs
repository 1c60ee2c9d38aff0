use common::domain::REDACTED;
use rand::Rng;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_CALTOPO_BASE_URL: &str = "https://caltopo.com/api/v1/position/report";

/// Domain every production base URL must belong to
pub const CALTOPO_DOMAIN: &str = "caltopo.com";

/// Backoff for a single destination delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound (exclusive) of the random delay added to each backoff
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// `base * 2^attempt` plus uniform jitter in `[0, max_jitter)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            self.max_jitter
                .mul_f64(rand::thread_rng().gen_range(0.0..1.0))
        };
        backoff.saturating_add(jitter)
    }
}

/// Reporter settings
#[derive(Clone)]
pub struct CalTopoReporterConfig {
    pub connect_key: Option<String>,
    pub group: Option<String>,
    pub base_url: String,
    /// Origins (scheme, host, port) plus path prefix exempt from the domain
    /// check, for local test servers
    pub allowed_test_urls: Vec<String>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CalTopoReporterConfig {
    fn default() -> Self {
        Self {
            connect_key: None,
            group: None,
            base_url: DEFAULT_CALTOPO_BASE_URL.to_string(),
            allowed_test_urls: Vec::new(),
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl fmt::Debug for CalTopoReporterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |id: &Option<String>| id.as_ref().map(|_| REDACTED);
        f.debug_struct("CalTopoReporterConfig")
            .field("connect_key", &redact(&self.connect_key))
            .field("group", &redact(&self.group))
            .field("base_url", &self.base_url)
            .field("allowed_test_urls", &self.allowed_test_urls)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay < Duration::from_millis(2500));
        }
    }

    #[test]
    fn test_debug_redacts_identifiers() {
        let config = CalTopoReporterConfig {
            connect_key: Some("PRIVATEKEY".to_string()),
            group: Some("TEAMGROUP".to_string()),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("PRIVATEKEY"));
        assert!(!rendered.contains("TEAMGROUP"));
    }

    #[test]
    fn test_delay_saturates() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(u32::MAX) >= Duration::from_secs(1));
    }
}
