//! # Message types for the wavechain relay protocol
//!
//! - **SensorVector / TimeEncoding**: the validated measurement carried along the chain
//! - **Envelope**: closed tagged union over the wire `type` field
//! - **Response**: the `{status, message}` reply written for every inbound message

pub mod envelope;
pub mod sensor;

pub use envelope::{
    kind, Envelope, MovementData, Payload, Probe, ReadySignal, RelayData, Response, Status,
    Timestamp,
};
pub use sensor::{SensorVector, TimeEncoding, SENSOR_MAX, SENSOR_MIN, SENSOR_VECTOR_LEN};
