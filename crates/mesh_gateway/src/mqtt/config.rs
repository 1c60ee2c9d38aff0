use common::domain::REDACTED;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTT_TOPIC: &str = "msh/US/2/json/+/+";

/// Subscriber connection settings
#[derive(Clone)]
pub struct MqttSubscriberConfig {
    /// Host name or `mqtt://host[:port]` / `tcp://host[:port]`
    pub broker: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for MqttSubscriberConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: DEFAULT_MQTT_PORT,
            topic: DEFAULT_MQTT_TOPIC.to_string(),
            client_id: "meshtopo-gateway".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
        }
    }
}

impl fmt::Debug for MqttSubscriberConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSubscriberConfig")
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("topic", &self.topic)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .field("keep_alive", &self.keep_alive)
            .field("reconnect_base_delay", &self.reconnect_base_delay)
            .field("reconnect_max_delay", &self.reconnect_max_delay)
            .finish()
    }
}

impl MqttSubscriberConfig {
    /// `min(base * 2^attempt, max)`
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.reconnect_max_delay)
    }
}
