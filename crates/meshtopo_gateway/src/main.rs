mod config;

use common::domain::KeyValueStore;
use common::sqlite::SqliteKeyValueStore;
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use config::ServiceConfig;
use mesh_gateway::MeshGateway;
use meshtopo_runner::Runner;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    // Optional config file path as the only argument
    let config_path = std::env::args().nth(1);
    let config = match ServiceConfig::load(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> =
        match init_telemetry(&config.telemetry_config()) {
            Ok(providers) => providers,
            Err(e) => {
                eprintln!("Failed to initialize telemetry: {}", e);
                std::process::exit(1);
            }
        };

    info!(
        broker = %config.mqtt.broker,
        topic = %config.mqtt.topic,
        static_nodes = config.nodes.len(),
        allow_unknown_devices = config.devices.allow_unknown_devices,
        otel_enabled = config.telemetry.otel_enabled,
        "Starting meshtopo gateway"
    );
    debug!("Configuration: {:?}", config);

    let store: Arc<dyn KeyValueStore> = match SqliteKeyValueStore::from_config(&config.sqlite_config()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, db_path = %config.storage.db_path, "Failed to open state store");
            std::process::exit(1);
        }
    };

    let gateway = match MeshGateway::new(config.gateway_config(), store) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "Failed to initialize mesh gateway");
            std::process::exit(1);
        }
    };

    gateway.check_connectivity().await;

    let (processes, gateway_closer) = gateway.into_runner_processes();

    let mut runner = Runner::new();
    for (name, process) in processes {
        runner = runner.with_named_process(name, process);
    }

    runner = runner
        .with_closer(move || async move {
            info!("Running cleanup tasks...");
            let result = gateway_closer().await;

            // Flush pending traces and logs
            shutdown_telemetry(telemetry_providers);

            info!("Cleanup complete");
            result
        })
        .with_closer_timeout(Duration::from_secs(10));

    runner.run().await;
}
