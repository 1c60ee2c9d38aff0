use async_trait::async_trait;

/// Position update for a single device, in decimal degrees
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Replaces the configured group destination for this report
    pub group: Option<String>,
}

/// Trait for delivering position updates to the remote mapping service
///
/// Implementations should:
/// - Deliver to every configured destination concurrently
/// - Retry transient failures within a bounded budget
/// - Return true if at least one destination accepted the update
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PositionReporter: Send + Sync {
    async fn report(&self, report: &PositionReport) -> bool;
}
