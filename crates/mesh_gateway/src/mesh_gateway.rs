use crate::caltopo::{CalTopoReporter, CalTopoReporterConfig};
use crate::domain::{
    run_stats_reporter, GatewayStats, IdentityPolicy, IdentityResolver, MeshMessageHandler,
    MessageRouter,
};
use crate::mqtt::{run_mqtt_subscriber, MqttSubscriberConfig};
use common::domain::{DomainResult, KeyValueStore, PositionReporter, StaticNodeTable};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type BoxedProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

type BoxedCloser =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

/// Everything the gateway needs besides the durable store
#[derive(Debug, Clone)]
pub struct MeshGatewayConfig {
    pub mqtt: MqttSubscriberConfig,
    pub caltopo: CalTopoReporterConfig,
    pub nodes: StaticNodeTable,
    pub identity: IdentityPolicy,
    pub stats_interval: Duration,
    /// Cap on position reports being delivered concurrently
    pub max_in_flight_reports: usize,
}

/// The assembled forwarding pipeline: subscriber -> router -> reporter
pub struct MeshGateway {
    mqtt: MqttSubscriberConfig,
    router: Arc<MessageRouter>,
    reporter: Arc<CalTopoReporter>,
    stats: Arc<GatewayStats>,
    stats_interval: Duration,
    report_token: CancellationToken,
}

impl MeshGateway {
    /// Wire up the pipeline. Fails on an untrusted CalTopo base URL or if
    /// the identity cache cannot be loaded.
    pub fn new(config: MeshGatewayConfig, store: Arc<dyn KeyValueStore>) -> DomainResult<Self> {
        debug!("initializing mesh gateway");

        let report_token = CancellationToken::new();
        let reporter = Arc::new(CalTopoReporter::new(
            config.caltopo,
            report_token.clone(),
        )?);
        let resolver = Arc::new(IdentityResolver::new(
            store,
            config.nodes,
            config.identity,
        )?);
        let stats = Arc::new(GatewayStats::new());
        let router = Arc::new(
            MessageRouter::new(
                resolver,
                Arc::clone(&reporter) as Arc<dyn PositionReporter>,
                Arc::clone(&stats),
            )
            .with_max_in_flight_reports(config.max_in_flight_reports),
        );

        Ok(Self {
            mqtt: config.mqtt,
            router,
            reporter,
            stats,
            stats_interval: config.stats_interval,
            report_token,
        })
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn stats(&self) -> &Arc<GatewayStats> {
        &self.stats
    }

    /// Startup probe of the CalTopo API; a failure is only logged
    pub async fn check_connectivity(&self) -> bool {
        let reachable = self.reporter.test_connection().await;
        if !reachable {
            warn!("CalTopo API connectivity test failed, continuing anyway");
        }
        reachable
    }

    /// Long-lived processes for the runner: the MQTT subscriber and the
    /// periodic stats logger. Cancelling either token also stops pending
    /// report retries.
    pub fn into_runner_processes(self) -> (Vec<(&'static str, BoxedProcess)>, BoxedCloser) {
        let subscriber: BoxedProcess = Box::new({
            let config = self.mqtt;
            let handler = Arc::clone(&self.router) as Arc<dyn MeshMessageHandler>;
            let report_token = self.report_token.clone();
            move |ctx| {
                Box::pin(async move {
                    run_mqtt_subscriber(config, handler, ctx).await;
                    report_token.cancel();
                    Ok(())
                })
            }
        });

        let stats_reporter: BoxedProcess = Box::new({
            let stats = Arc::clone(&self.stats);
            let interval = self.stats_interval;
            move |ctx| {
                Box::pin(async move {
                    run_stats_reporter(stats, interval, ctx).await;
                    Ok(())
                })
            }
        });

        let closer: BoxedCloser = Box::new({
            let router = self.router;
            let report_token = self.report_token;
            move || {
                Box::pin(async move {
                    report_token.cancel();
                    router.wait_for_in_flight_reports().await;
                    router.stats().log_statistics();
                    info!("mesh gateway stopped");
                    Ok(())
                })
            }
        });

        (
            vec![("mqtt_subscriber", subscriber), ("stats_reporter", stats_reporter)],
            closer,
        )
    }
}
