use crate::error::{WaveError, WaveResult};
use crate::message::sensor::{SensorVector, TimeEncoding};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Wire names of the recognized envelope types
pub mod kind {
    pub const MOVEMENT_DATA: &str = "movement_data";
    pub const DATA: &str = "data";
    pub const READY_SIGNAL: &str = "ready_signal";
    pub const ACK: &str = "ack";
    pub const DISCOVERY: &str = "discovery";
    pub const CONNECT: &str = "connect";
    pub const STATUS_REQUEST: &str = "status_request";
}

/// Envelope timestamp, either a formatted string or epoch seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Seconds(f64),
    Text(String),
}

impl Timestamp {
    /// Local wall-clock timestamp, `2025-03-30 23:44:57.831136` style
    pub fn now() -> Self {
        Timestamp::Text(
            chrono::Local::now()
                .format("%Y-%m-%d %H:%M:%S%.6f")
                .to_string(),
        )
    }

    /// Stable string key, used for de-duplication
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Seconds(secs) => write!(f, "{}", secs),
            Timestamp::Text(text) => write!(f, "{}", text),
        }
    }
}

/// A validated measurement: sensor vector plus the time it was taken
#[derive(Debug, Clone, PartialEq)]
pub struct MovementData {
    pub vector: SensorVector,
    pub time: TimeEncoding,
}

/// Raw, unscaled movement series as produced by an input node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayData {
    pub movements: Vec<f64>,
}

/// Flow-control message telling a feeder its last row was fully processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadySignal {
    pub source: String,
    /// Timestamp of the row that was processed, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<Timestamp>,
}

/// Topology probe body shared by `discovery` and `connect`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

/// Closed set of envelope bodies, one per recognized wire `type`
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    MovementData(MovementData),
    Data(RelayData),
    ReadySignal(ReadySignal),
    Ack,
    Discovery(Probe),
    Connect(Probe),
    StatusRequest,
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::MovementData(_) => kind::MOVEMENT_DATA,
            Payload::Data(_) => kind::DATA,
            Payload::ReadySignal(_) => kind::READY_SIGNAL,
            Payload::Ack => kind::ACK,
            Payload::Discovery(_) => kind::DISCOVERY,
            Payload::Connect(_) => kind::CONNECT,
            Payload::StatusRequest => kind::STATUS_REQUEST,
        }
    }
}

/// Typed message unit exchanged between nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub timestamp: Timestamp,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            timestamp: Timestamp::now(),
            payload,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn movement(vector: SensorVector, time: TimeEncoding) -> Self {
        Self::new(Payload::MovementData(MovementData { vector, time }))
    }

    pub fn ready(source: impl Into<String>, row: Option<Timestamp>) -> Self {
        Self::new(Payload::ReadySignal(ReadySignal {
            source: source.into(),
            row,
        }))
    }

    pub fn ack() -> Self {
        Self::new(Payload::Ack)
    }

    pub fn discovery(node: Option<String>) -> Self {
        Self::new(Payload::Discovery(Probe { node }))
    }

    pub fn status_request() -> Self {
        Self::new(Payload::StatusRequest)
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Whether this envelope starts a drive/forward cycle on a relay node
    pub fn is_trigger(&self) -> bool {
        matches!(self.payload, Payload::MovementData(_) | Payload::Data(_))
    }

    /// Parse one JSON text message; every failure maps to a protocol error
    pub fn from_json(text: &str) -> WaveResult<Self> {
        let wire: WireEnvelope = serde_json::from_str(text).map_err(|e| {
            if e.is_data() {
                WaveError::protocol(e.to_string())
            } else {
                WaveError::protocol(format!("Invalid JSON format: {}", e))
            }
        })?;
        Envelope::try_from(wire)
    }

    pub fn to_json(&self) -> WaveResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `movement_data` body as it travels on the wire
#[derive(Serialize, Deserialize)]
struct MovementWire {
    pot_values: SensorVector,
    t_sin: f64,
    t_cos: f64,
}

/// Loose JSON shape; converted into `Envelope` with exhaustive type matching
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

fn body<T: for<'de> Deserialize<'de>>(kind: &str, data: Option<Value>) -> WaveResult<T> {
    let data = data.ok_or_else(|| WaveError::protocol(format!("'{}' message without data", kind)))?;
    serde_json::from_value(data)
        .map_err(|e| WaveError::protocol(format!("Invalid '{}' data: {}", kind, e)))
}

fn optional_body<T: for<'de> Deserialize<'de> + Default>(kind: &str, data: Option<Value>) -> WaveResult<T> {
    match data {
        None | Some(Value::Null) => Ok(T::default()),
        Some(data) => body(kind, Some(data)),
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = WaveError;

    fn try_from(wire: WireEnvelope) -> WaveResult<Self> {
        let payload = match wire.kind.as_str() {
            kind::MOVEMENT_DATA => {
                let movement: MovementWire = body(kind::MOVEMENT_DATA, wire.data)?;
                Payload::MovementData(MovementData {
                    vector: movement.pot_values,
                    time: TimeEncoding::new(movement.t_sin, movement.t_cos)?,
                })
            }
            kind::DATA => Payload::Data(body(kind::DATA, wire.data)?),
            kind::READY_SIGNAL => Payload::ReadySignal(body(kind::READY_SIGNAL, wire.data)?),
            kind::ACK => Payload::Ack,
            kind::DISCOVERY => Payload::Discovery(optional_body(kind::DISCOVERY, wire.data)?),
            kind::CONNECT => Payload::Connect(optional_body(kind::CONNECT, wire.data)?),
            kind::STATUS_REQUEST => Payload::StatusRequest,
            other => {
                return Err(WaveError::protocol(format!(
                    "Unknown message type: {}",
                    other
                )))
            }
        };

        Ok(Envelope {
            timestamp: wire.timestamp.unwrap_or_else(Timestamp::now),
            payload,
        })
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let kind = envelope.kind().to_string();
        let data = match envelope.payload {
            Payload::MovementData(movement) => serde_json::to_value(MovementWire {
                t_sin: movement.time.sin(),
                t_cos: movement.time.cos(),
                pot_values: movement.vector,
            })
            .ok(),
            Payload::Data(relay) => serde_json::to_value(relay).ok(),
            Payload::ReadySignal(ready) => serde_json::to_value(ready).ok(),
            Payload::Discovery(probe) | Payload::Connect(probe) => serde_json::to_value(probe).ok(),
            Payload::Ack | Payload::StatusRequest => None,
        };

        WireEnvelope {
            kind,
            timestamp: Some(envelope.timestamp),
            data,
        }
    }
}

/// Outcome flag of a response envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[serde(alias = "ok")]
    Success,
    #[serde(alias = "rejected")]
    Error,
}

/// Reply sent back over the same connection for every inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            message: message.into(),
            node: None,
            state: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
            node: None,
            state: None,
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_state(mut self, state: impl ToString) -> Self {
        self.state = Some(state.to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn from_json(text: &str) -> WaveResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| WaveError::protocol(format!("Invalid response: {}", e)))
    }

    pub fn to_json(&self) -> WaveResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<&WaveError> for Response {
    fn from(err: &WaveError) -> Self {
        Response::error(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_movement() -> Envelope {
        Envelope::movement(
            SensorVector::filled(100.0).unwrap(),
            TimeEncoding::new(0.0, 1.0).unwrap(),
        )
    }

    #[test]
    fn test_movement_wire_shape() {
        let json = sample_movement().to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "movement_data");
        assert_eq!(value["data"]["pot_values"].as_array().unwrap().len(), 30);
        assert_eq!(value["data"]["t_cos"], 1.0);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_parses_canned_test_package() {
        let text = r#"{
            "type": "movement_data",
            "timestamp": "2025-03-30 23:44:57.831136",
            "data": {
                "pot_values": [123, 126, 100, 108, 124, 125, 77, 61, 127, 126,
                               120, 109, 125, 125, 20, 20, 110, 110, 20, 20,
                               108, 108, 25, 28, 20, 107, 106, 23, 29, 20],
                "t_sin": 0.8313819709444351,
                "t_cos": 0.5557013751904403
            }
        }"#;
        let envelope = Envelope::from_json(text).unwrap();
        assert_eq!(
            envelope.timestamp,
            Timestamp::Text("2025-03-30 23:44:57.831136".into())
        );
        match envelope.payload {
            Payload::MovementData(movement) => {
                assert_eq!(movement.vector.values()[0], 123.0);
                assert_eq!(movement.vector.values()[29], 20.0);
                assert_eq!(movement.time.sin(), 0.8313819709444351);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_numeric_timestamp_accepted() {
        let envelope = Envelope::from_json(r#"{"type":"ack","timestamp":1711842297.5}"#).unwrap();
        assert_eq!(envelope.timestamp, Timestamp::Seconds(1711842297.5));
        assert_eq!(envelope.payload, Payload::Ack);
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = Envelope::from_json(r#"{"type":"command","data":{}}"#).unwrap_err();
        assert!(matches!(err, WaveError::Protocol(_)));
        assert!(err.to_string().contains("Unknown message type: command"));
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        let err = Envelope::from_json("{not json").unwrap_err();
        assert!(matches!(err, WaveError::Protocol(_)));
        assert!(err.to_string().contains("Invalid JSON format"));
    }

    #[test]
    fn test_out_of_range_vector_rejected_on_parse() {
        let mut values = vec![100; 30];
        values[4] = 200;
        let text = serde_json::json!({
            "type": "movement_data",
            "timestamp": "t",
            "data": {"pot_values": values, "t_sin": 0.0, "t_cos": 1.0}
        })
        .to_string();
        assert!(Envelope::from_json(&text).is_err());
    }

    #[test]
    fn test_probe_without_data() {
        let envelope = Envelope::from_json(r#"{"type":"discovery"}"#).unwrap();
        assert_eq!(envelope.payload, Payload::Discovery(Probe::default()));
    }

    #[test]
    fn test_ready_signal_roundtrip() {
        let ready = Envelope::ready("trainer", Some(Timestamp::Text("row-1".into())));
        let back = Envelope::from_json(&ready.to_json().unwrap()).unwrap();
        assert_eq!(back, ready);
    }

    #[test]
    fn test_response_accepts_legacy_status_words() {
        let ok = Response::from_json(r#"{"status":"ok","message":"Data accepted"}"#).unwrap();
        assert!(ok.is_success());
        let rejected = Response::from_json(r#"{"status":"rejected","message":"busy"}"#).unwrap();
        assert!(!rejected.is_success());
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let json = Response::success("accepted").to_json().unwrap();
        assert_eq!(json, r#"{"status":"success","message":"accepted"}"#);
    }
}
