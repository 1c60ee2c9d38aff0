use crate::domain::result::{DomainError, DomainResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Key injected into every bus payload carrying the transport retain flag
pub const RETAINED_KEY: &str = "retained";

/// Scale factor of integer-encoded coordinates
pub const COORDINATE_SCALE: f64 = 1e7;

/// Declared kind of a mesh message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    Position,
    NodeInfo,
    Telemetry,
    Traceroute,
    Empty,
    Unknown(String),
}

impl MessageType {
    pub fn parse(value: &str) -> Self {
        match value {
            "position" => MessageType::Position,
            "nodeinfo" => MessageType::NodeInfo,
            "telemetry" => MessageType::Telemetry,
            "traceroute" => MessageType::Traceroute,
            "" => MessageType::Empty,
            other => MessageType::Unknown(other.to_string()),
        }
    }
}

/// Decoded bus event
///
/// Built from the JSON object published on the bus. Only `from` is required
/// for routing; everything else is checked by the type-specific handler.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshMessage {
    pub from: Option<u64>,
    pub message_type: MessageType,
    pub payload: Option<Value>,
    pub sender: Option<String>,
    pub retained: bool,
}

impl MeshMessage {
    /// Build a message from a decoded JSON value
    ///
    /// Fails only if the value is not a JSON object. A missing or
    /// non-numeric `from` yields `from: None`, and a missing `type` is
    /// treated as empty.
    pub fn from_json(value: Value) -> DomainResult<Self> {
        let Value::Object(mut object) = value else {
            return Err(DomainError::InvalidMessage(
                "payload is not a JSON object".to_string(),
            ));
        };

        let from = object.get("from").and_then(Value::as_u64);
        let message_type = MessageType::parse(
            object
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        );
        let sender = object
            .get("sender")
            .and_then(Value::as_str)
            .map(str::to_string);
        let retained = object
            .get(RETAINED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let payload = object.remove("payload").filter(|p| !p.is_null());

        Ok(Self {
            from,
            message_type,
            payload,
            sender,
            retained,
        })
    }

    /// Decode the payload into a typed structure
    pub fn payload_as<T: DeserializeOwned>(&self) -> DomainResult<T> {
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| DomainError::InvalidMessage("missing payload".to_string()))?;
        serde_json::from_value(payload.clone())
            .map_err(|e| DomainError::InvalidMessage(format!("malformed payload: {}", e)))
    }
}

/// Position payload with coordinates scaled by 1e7
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PositionPayload {
    pub latitude_i: i32,
    pub longitude_i: i32,
    #[serde(default)]
    pub altitude: Option<i32>,
}

impl PositionPayload {
    pub fn latitude(&self) -> f64 {
        f64::from(self.latitude_i) / COORDINATE_SCALE
    }

    pub fn longitude(&self) -> f64 {
        f64::from(self.longitude_i) / COORDINATE_SCALE
    }
}

/// Identity broadcast of a node
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NodeInfoPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub longname: Option<String>,
    #[serde(default)]
    pub shortname: Option<String>,
    #[serde(default)]
    pub hardware: Option<Value>,
    #[serde(default)]
    pub role: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TelemetryPayload {
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub voltage: Option<f64>,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
    #[serde(default)]
    pub air_util_tx: Option<f64>,
    #[serde(default)]
    pub channel_utilization: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TraceroutePayload {
    #[serde(default)]
    pub route: Vec<Value>,
}
