use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pipeline counters, shared between the router, report tasks and the
/// periodic stats logger.
#[derive(Debug)]
pub struct GatewayStats {
    started_at: DateTime<Utc>,
    messages_received: AtomicU64,
    messages_processed: AtomicU64,
    position_updates_sent: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`GatewayStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime_secs: i64,
    pub messages_received: u64,
    pub messages_processed: u64,
    pub position_updates_sent: u64,
    pub errors: u64,
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            messages_received: AtomicU64::new(0),
            messages_processed: AtomicU64::new(0),
            position_updates_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.position_updates_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            position_updates_sent: self.position_updates_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn log_statistics(&self) {
        let snapshot = self.snapshot();
        info!(
            uptime_secs = snapshot.uptime_secs,
            messages_received = snapshot.messages_received,
            messages_processed = snapshot.messages_processed,
            position_updates_sent = snapshot.position_updates_sent,
            errors = snapshot.errors,
            "gateway statistics"
        );
    }
}

/// Log statistics every `interval` until the token is cancelled
pub async fn run_stats_reporter(
    stats: Arc<GatewayStats>,
    interval: Duration,
    shutdown_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => {
                debug!("stats reporter stopped");
                return;
            }
            _ = ticker.tick() => stats.log_statistics(),
        }
    }
}
