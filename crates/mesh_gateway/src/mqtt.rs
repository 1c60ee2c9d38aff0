mod config;
mod subscriber;

pub use config::*;
pub use subscriber::{handle_mqtt_message, parse_broker_url, run_mqtt_subscriber};
