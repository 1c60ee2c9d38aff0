use common::domain::{DomainError, NodeMapping, StaticNodeTable, REDACTED};
use common::sqlite::SqliteConfig;
use common::telemetry::{LogFormat, TelemetryConfig};
use common::validation::{caltopo_identifier, validate_struct};
use config::{Config, ConfigError, Environment, File};
use garde::Validate;
use mesh_gateway::{
    CalTopoReporterConfig, IdentityPolicy, MeshGatewayConfig, MqttSubscriberConfig, RetryPolicy,
    DEFAULT_CALTOPO_BASE_URL, DEFAULT_MAX_IN_FLIGHT_REPORTS, DEFAULT_MQTT_PORT,
    DEFAULT_MQTT_TOPIC,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "MESHTOPO";
pub const CONFIG_FILE_ENV: &str = "MESHTOPO_CONFIG_FILE";
pub const DEFAULT_CONFIG_FILE: &str = "config/config.yaml";

#[derive(Debug, Deserialize, Serialize, Clone, Validate)]
pub struct ServiceConfig {
    #[serde(default)]
    #[garde(dive)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    #[garde(dive)]
    pub caltopo: CalTopoConfig,

    /// Statically configured nodes keyed by stable device id
    #[serde(default)]
    #[garde(skip)]
    pub nodes: HashMap<String, NodeConfig>,

    #[serde(default)]
    #[garde(skip)]
    pub devices: DevicesConfig,

    #[serde(default)]
    #[garde(skip)]
    pub storage: StorageConfig,

    #[serde(default)]
    #[garde(skip)]
    pub logging: LoggingConfig,

    #[serde(default)]
    #[garde(skip)]
    pub telemetry: OtelConfig,

    /// Seconds between statistics log lines
    #[serde(default = "default_stats_interval_secs")]
    #[garde(range(min = 1))]
    pub stats_interval_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Validate)]
pub struct MqttConfig {
    /// Broker host, optionally `mqtt://host:port`
    #[serde(default = "default_mqtt_broker")]
    #[garde(length(min = 1))]
    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    #[garde(range(min = 1))]
    pub port: u16,

    #[serde(default)]
    #[garde(skip)]
    pub username: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub password: Option<String>,

    #[serde(default = "default_mqtt_topic")]
    #[garde(length(min = 1))]
    pub topic: String,

    #[serde(default = "default_mqtt_client_id")]
    #[garde(length(min = 1))]
    pub client_id: String,

    #[serde(default = "default_mqtt_keepalive_secs")]
    #[garde(range(min = 5))]
    pub keepalive_secs: u64,

    #[serde(default = "default_reconnect_base_delay_secs")]
    #[garde(range(min = 1))]
    pub reconnect_base_delay_secs: u64,

    #[serde(default = "default_reconnect_max_delay_secs")]
    #[garde(range(min = 1))]
    pub reconnect_max_delay_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Validate)]
pub struct CalTopoConfig {
    /// Private per-operator connect key
    #[serde(default)]
    #[garde(custom(caltopo_identifier))]
    pub connect_key: Option<String>,

    /// Shared team group id
    #[serde(default)]
    #[garde(custom(caltopo_identifier))]
    pub group: Option<String>,

    #[serde(default = "default_caltopo_base_url")]
    #[garde(length(min = 1))]
    pub base_url: String,

    /// Base URLs outside caltopo.com accepted for testing: same scheme, host
    /// and port, path under the entry path
    #[serde(default)]
    #[garde(skip)]
    pub allowed_test_urls: Vec<String>,

    #[serde(default = "default_caltopo_timeout_secs")]
    #[garde(range(min = 1))]
    pub timeout_secs: u64,

    #[serde(default = "default_caltopo_max_retries")]
    #[garde(range(max = 10))]
    pub max_retries: u32,

    #[serde(default = "default_caltopo_retry_base_delay_ms")]
    #[garde(skip)]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_caltopo_retry_max_jitter_ms")]
    #[garde(skip)]
    pub retry_max_jitter_ms: u64,

    /// Reports delivered concurrently; positions beyond this are dropped
    #[serde(default = "default_caltopo_max_in_flight_reports")]
    #[garde(range(min = 1))]
    pub max_in_flight_reports: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NodeConfig {
    /// Label reported to CalTopo for this node
    pub device_id: String,

    /// Group override for this node
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DevicesConfig {
    #[serde(default = "default_allow_unknown_devices")]
    pub allow_unknown_devices: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Delete and recreate an incompatible database file at startup
    #[serde(default = "default_recover_on_open")]
    pub recover_on_open: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OtelConfig {
    #[serde(default)]
    pub otel_enabled: bool,

    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_service_name")]
    pub service_name: String,
}

fn default_stats_interval_secs() -> u64 {
    60
}

fn default_mqtt_broker() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_mqtt_topic() -> String {
    DEFAULT_MQTT_TOPIC.to_string()
}

fn default_mqtt_client_id() -> String {
    "meshtopo-gateway".to_string()
}

fn default_mqtt_keepalive_secs() -> u64 {
    60
}

fn default_reconnect_base_delay_secs() -> u64 {
    1
}

fn default_reconnect_max_delay_secs() -> u64 {
    60
}

fn default_caltopo_base_url() -> String {
    DEFAULT_CALTOPO_BASE_URL.to_string()
}

fn default_caltopo_timeout_secs() -> u64 {
    10
}

fn default_caltopo_max_retries() -> u32 {
    3
}

fn default_caltopo_retry_base_delay_ms() -> u64 {
    1000
}

fn default_caltopo_retry_max_jitter_ms() -> u64 {
    500
}

fn default_caltopo_max_in_flight_reports() -> usize {
    DEFAULT_MAX_IN_FLIGHT_REPORTS
}

fn default_allow_unknown_devices() -> bool {
    true
}

fn default_db_path() -> String {
    "meshtopo_state.sqlite".to_string()
}

fn default_recover_on_open() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "meshtopo-gateway".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_mqtt_broker(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            topic: default_mqtt_topic(),
            client_id: default_mqtt_client_id(),
            keepalive_secs: default_mqtt_keepalive_secs(),
            reconnect_base_delay_secs: default_reconnect_base_delay_secs(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
        }
    }
}

impl Default for CalTopoConfig {
    fn default() -> Self {
        Self {
            connect_key: None,
            group: None,
            base_url: default_caltopo_base_url(),
            allowed_test_urls: Vec::new(),
            timeout_secs: default_caltopo_timeout_secs(),
            max_retries: default_caltopo_max_retries(),
            retry_base_delay_ms: default_caltopo_retry_base_delay_ms(),
            retry_max_jitter_ms: default_caltopo_retry_max_jitter_ms(),
            max_in_flight_reports: default_caltopo_max_in_flight_reports(),
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            allow_unknown_devices: default_allow_unknown_devices(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            recover_on_open: default_recover_on_open(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            otel_enabled: false,
            otel_endpoint: default_otel_endpoint(),
            service_name: default_otel_service_name(),
        }
    }
}

impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .field("topic", &self.topic)
            .field("client_id", &self.client_id)
            .field("keepalive_secs", &self.keepalive_secs)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for CalTopoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalTopoConfig")
            .field("connect_key", &self.connect_key.as_ref().map(|_| REDACTED))
            .field("group", &self.group.as_ref().map(|_| REDACTED))
            .field("base_url", &self.base_url)
            .field("allowed_test_urls", &self.allowed_test_urls)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("max_in_flight_reports", &self.max_in_flight_reports)
            .finish_non_exhaustive()
    }
}

impl ServiceConfig {
    /// Load, normalize and validate the configuration.
    ///
    /// The file is `path` if given (and must exist), else
    /// `$MESHTOPO_CONFIG_FILE`, else `config/config.yaml` if present.
    /// `MESHTOPO_<SECTION>__<KEY>` variables override file values.
    pub fn load(path: Option<&str>) -> Result<Self, DomainError> {
        let (file, required) = match path {
            Some(path) => (path.to_string(), true),
            None => match std::env::var(CONFIG_FILE_ENV) {
                Ok(path) => (path, true),
                Err(_) => (DEFAULT_CONFIG_FILE.to_string(), false),
            },
        };

        let mut config = Self::from_sources(Some((Path::new(&file), required)))
            .map_err(|e| DomainError::InvalidConfiguration(e.to_string()))?;
        config.normalize();
        config.check()?;
        Ok(config)
    }

    /// Deserialize from an optional file layered under the environment
    pub fn from_sources(file: Option<(&Path, bool)>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some((path, required)) = file {
            builder = builder.add_source(File::from(path).required(required));
        }
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("caltopo.allowed_test_urls"),
            )
            .build()?
            .try_deserialize()
    }

    /// Trim destination identifiers; blank ones become absent
    pub fn normalize(&mut self) {
        fn trimmed(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }
        self.caltopo.connect_key = trimmed(self.caltopo.connect_key.take());
        self.caltopo.group = trimmed(self.caltopo.group.take());
    }

    /// Field rules plus the cross-field requirements
    pub fn check(&self) -> Result<(), DomainError> {
        validate_struct(self)?;

        if self.caltopo.connect_key.is_none() && self.caltopo.group.is_none() {
            return Err(DomainError::InvalidConfiguration(
                "at least one of caltopo.connect_key or caltopo.group must be set".to_string(),
            ));
        }

        if let Some(id) = self
            .nodes
            .iter()
            .find_map(|(id, node)| node.device_id.trim().is_empty().then_some(id))
        {
            return Err(DomainError::InvalidConfiguration(format!(
                "node {} has an empty device_id",
                id
            )));
        }

        if self.mqtt.reconnect_max_delay_secs < self.mqtt.reconnect_base_delay_secs {
            return Err(DomainError::InvalidConfiguration(
                "mqtt.reconnect_max_delay_secs must not be below reconnect_base_delay_secs"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.telemetry.service_name.clone(),
            otel_endpoint: self.telemetry.otel_endpoint.clone(),
            otel_enabled: self.telemetry.otel_enabled,
            log_level: self.logging.level.clone(),
            log_format: self.logging.format,
        }
    }

    pub fn sqlite_config(&self) -> SqliteConfig {
        SqliteConfig {
            db_path: self.storage.db_path.clone(),
            recover_on_open: self.storage.recover_on_open,
        }
    }

    pub fn mqtt_subscriber_config(&self) -> MqttSubscriberConfig {
        MqttSubscriberConfig {
            broker: self.mqtt.broker.clone(),
            port: self.mqtt.port,
            topic: self.mqtt.topic.clone(),
            client_id: self.mqtt.client_id.clone(),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
            keep_alive: Duration::from_secs(self.mqtt.keepalive_secs),
            reconnect_base_delay: Duration::from_secs(self.mqtt.reconnect_base_delay_secs),
            reconnect_max_delay: Duration::from_secs(self.mqtt.reconnect_max_delay_secs),
        }
    }

    pub fn caltopo_reporter_config(&self) -> CalTopoReporterConfig {
        CalTopoReporterConfig {
            connect_key: self.caltopo.connect_key.clone(),
            group: self.caltopo.group.clone(),
            base_url: self.caltopo.base_url.clone(),
            allowed_test_urls: self.caltopo.allowed_test_urls.clone(),
            request_timeout: Duration::from_secs(self.caltopo.timeout_secs),
            retry: RetryPolicy {
                max_retries: self.caltopo.max_retries,
                base_delay: Duration::from_millis(self.caltopo.retry_base_delay_ms),
                max_jitter: Duration::from_millis(self.caltopo.retry_max_jitter_ms),
            },
        }
    }

    pub fn static_node_table(&self) -> StaticNodeTable {
        StaticNodeTable::new(
            self.nodes
                .iter()
                .map(|(id, node)| {
                    (
                        id.clone(),
                        NodeMapping {
                            device_id: node.device_id.clone(),
                            group: node.group.clone(),
                        },
                    )
                })
                .collect(),
        )
    }

    pub fn gateway_config(&self) -> MeshGatewayConfig {
        MeshGatewayConfig {
            mqtt: self.mqtt_subscriber_config(),
            caltopo: self.caltopo_reporter_config(),
            nodes: self.static_node_table(),
            identity: IdentityPolicy {
                allow_unknown_devices: self.devices.allow_unknown_devices,
            },
            stats_interval: Duration::from_secs(self.stats_interval_secs),
            max_in_flight_reports: self.caltopo.max_in_flight_reports,
        }
    }
}
