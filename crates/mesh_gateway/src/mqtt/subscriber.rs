use crate::domain::MeshMessageHandler;
use crate::mqtt::MqttSubscriberConfig;
use common::domain::{
    sanitize_for_log, DomainError, DomainResult, MeshMessage, RETAINED_KEY,
};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
        };
        f.write_str(state)
    }
}

/// Run the MQTT subscriber until `shutdown_token` is cancelled.
///
/// Reconnects forever with capped exponential backoff; the attempt counter
/// resets whenever the broker acknowledges a connection.
#[instrument(
    name = "mqtt_subscriber",
    skip_all,
    fields(broker = %config.broker, topic = %config.topic)
)]
pub async fn run_mqtt_subscriber(
    config: MqttSubscriberConfig,
    handler: Arc<dyn MeshMessageHandler>,
    shutdown_token: CancellationToken,
) {
    info!("starting MQTT subscriber");

    let mut backoff = ReconnectBackoff::default();

    loop {
        if shutdown_token.is_cancelled() {
            debug!("MQTT subscriber cancelled before connection");
            break;
        }

        match run_mqtt_connection(&config, handler.as_ref(), &shutdown_token, &mut backoff).await {
            Ok(()) => {
                debug!("MQTT subscriber stopped cleanly");
                break;
            }
            Err(e) => {
                error!(error = %e, state = %ConnectionState::Disconnected, "MQTT connection error");

                let delay = backoff.next_delay(&config);
                warn!(
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting to MQTT broker"
                );

                tokio::select! {
                    _ = shutdown_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!("MQTT subscriber stopped");
}

/// One connection session; `Ok` only on cancellation
async fn run_mqtt_connection(
    config: &MqttSubscriberConfig,
    handler: &dyn MeshMessageHandler,
    shutdown_token: &CancellationToken,
    backoff: &mut ReconnectBackoff,
) -> DomainResult<()> {
    let (host, port) = parse_broker_url(&config.broker, config.port)?;
    debug!(host = host, port = port, state = %ConnectionState::Connecting, "connecting to MQTT broker");

    let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
    mqtt_options.set_keep_alive(config.keep_alive);
    mqtt_options.set_clean_session(true);
    if let Some(username) = &config.username {
        mqtt_options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    client
        .subscribe(&config.topic, QoS::AtLeastOnce)
        .await
        .map_err(|e| DomainError::MqttError(format!("failed to subscribe: {}", e)))?;

    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => {
                debug!("shutdown signal received");
                let _ = client.disconnect().await;
                return Ok(());
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(packet)) => {
                        handle_incoming(packet, &config.topic, handler, backoff)?;
                    }
                    Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        return Err(DomainError::MqttError(format!("event loop error: {}", e)));
                    }
                }
            }
        }
    }
}

/// Reconnect attempt counter behind `min(base * 2^attempt, max)`
#[derive(Debug, Default)]
struct ReconnectBackoff {
    attempt: u32,
}

impl ReconnectBackoff {
    /// Delay before the next reconnect; advances the counter
    fn next_delay(&mut self, config: &MqttSubscriberConfig) -> Duration {
        let delay = config.reconnect_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// React to one packet from the broker. `Err` ends the connection session.
fn handle_incoming(
    packet: Packet,
    topic: &str,
    handler: &dyn MeshMessageHandler,
    backoff: &mut ReconnectBackoff,
) -> DomainResult<()> {
    match packet {
        Packet::Publish(publish) => {
            handle_mqtt_message(&publish.topic, &publish.payload, publish.retain, handler);
        }
        Packet::ConnAck(_) => {
            backoff.reset();
            info!("connected to MQTT broker");
        }
        Packet::SubAck(_) => {
            info!(topic = %topic, state = %ConnectionState::Subscribed, "subscribed to MQTT topic");
        }
        Packet::Disconnect => {
            return Err(DomainError::MqttError(
                "broker closed the connection".to_string(),
            ));
        }
        _ => {}
    }
    Ok(())
}

/// Decode one MQTT publish and hand it to `handler`.
///
/// Runs in its own root span. Undecodable payloads are logged and dropped.
pub fn handle_mqtt_message(
    topic: &str,
    payload: &[u8],
    retained: bool,
    handler: &dyn MeshMessageHandler,
) {
    let span = info_span!(
        parent: Span::none(),
        "mqtt_message",
        topic = %sanitize_for_log(topic),
        payload_size = payload.len(),
        retained = retained,
        node_num = tracing::field::Empty,
    );

    span.in_scope(|| {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "MQTT payload is not UTF-8, skipping message");
                return;
            }
        };

        let mut value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %sanitize_for_log(text),
                    "failed to parse MQTT payload as JSON, skipping message"
                );
                return;
            }
        };

        if let Value::Object(object) = &mut value {
            object.insert(RETAINED_KEY.to_string(), Value::Bool(retained));
        }

        match MeshMessage::from_json(value) {
            Ok(message) => {
                if let Some(node_num) = message.from {
                    Span::current().record("node_num", node_num);
                }
                handler.handle_message(message);
            }
            Err(e) => warn!(error = %e, "skipping MQTT message"),
        }
    })
}

/// Parse `mqtt://host:port`, `tcp://host:port`, `host:port` or `host`
pub fn parse_broker_url(url: &str, default_port: u16) -> DomainResult<(&str, u16)> {
    let url = url.trim_start_matches("mqtt://");
    let url = url.trim_start_matches("tcp://");

    let parts: Vec<&str> = url.split(':').collect();
    match parts.as_slice() {
        [host] if !host.is_empty() => Ok((*host, default_port)),
        [host, port] if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                DomainError::InvalidConfiguration(format!("invalid port in broker URL: {}", port))
            })?;
            Ok((*host, port))
        }
        _ => Err(DomainError::InvalidConfiguration(format!(
            "invalid broker URL format: {}",
            url
        ))),
    }
}
