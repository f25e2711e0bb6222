//! Error types shared by every wavechain component.
//!
//! The variants follow the failure taxonomy of the relay protocol:
//! connectivity, protocol, hardware and configuration failures, plus the
//! validation and batch errors raised by the data model and the ack gate.

use std::time::Duration;
use thiserror::Error;

/// Main error type for wavechain operations
#[derive(Debug, Error)]
pub enum WaveError {
    /// Connect, write or read towards a peer failed
    #[error("Connectivity failure towards {peer}: {message}")]
    Connectivity { peer: String, message: String },

    /// Malformed JSON, oversized frame or an unknown envelope type
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An actuation port call failed
    #[error("Hardware failure: {0}")]
    Hardware(String),

    /// Missing route, destination or node entry in the chain topology
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A value broke a data model invariant
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Config file could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// A batch relay stopped before its last row
    #[error("Batch aborted at row {row}: {reason}")]
    BatchAborted { row: usize, reason: String },

    /// The consumer never signalled readiness for a row
    #[error("No ready signal for row {row} within {timeout:?}")]
    ReadyTimeout { row: usize, timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Convenience alias used across the crate
pub type WaveResult<T> = Result<T, WaveError>;

impl WaveError {
    pub fn connectivity(peer: impl ToString, message: impl ToString) -> Self {
        WaveError::Connectivity {
            peer: peer.to_string(),
            message: message.to_string(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        WaveError::Protocol(message.into())
    }

    pub fn hardware(message: impl Into<String>) -> Self {
        WaveError::Hardware(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        WaveError::Configuration(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        WaveError::Validation(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        WaveError::Config(message.into())
    }

    /// Short label for the failure class, used in structured log fields
    pub fn kind(&self) -> &'static str {
        match self {
            WaveError::Connectivity { .. } => "connectivity",
            WaveError::Protocol(_) => "protocol",
            WaveError::Hardware(_) => "hardware",
            WaveError::Configuration(_) => "configuration",
            WaveError::Validation(_) => "validation",
            WaveError::Config(_) => "config",
            WaveError::BatchAborted { .. } => "batch_aborted",
            WaveError::ReadyTimeout { .. } => "ready_timeout",
            WaveError::Io(_) => "io",
            WaveError::Serialization(_) => "serialization",
            WaveError::Csv(_) => "csv",
        }
    }
}

impl From<serde_yaml::Error> for WaveError {
    fn from(err: serde_yaml::Error) -> Self {
        WaveError::Config(format!("YAML: {}", err))
    }
}

impl From<toml::de::Error> for WaveError {
    fn from(err: toml::de::Error) -> Self {
        WaveError::Config(format!("TOML: {}", err))
    }
}
