//! # Wavechain Core
//!
//! Runtime for a chain of physical nodes that pass a 30-value sensor vector
//! from one node to the next. Each node drives its actuator with the vector,
//! then forwards it to its configured next hop.
//!
//! - **Message**: validated sensor vector, time encoding and the wire envelope
//! - **Communication**: framed JSON transport, relay buffer and batch handshake
//! - **Core**: the per-node state machine and its async runner
//! - **Hardware**: the actuation port trait and its adapters
//! - **Config**: chain topology and shared settings
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wavechain_core::{bind_node, ChainTopology, NodeContext, SimulatedPort};
//!
//! # async fn demo() -> wavechain_core::WaveResult<()> {
//! let topology = ChainTopology::find_and_load()?;
//! let ctx = NodeContext::from_topology(&topology, "res01")?;
//! let (runner, _server) = bind_node(ctx, SimulatedPort::new(), "0.0.0.0:8765").await?;
//! runner.run(async { let _ = tokio::signal::ctrl_c().await; }).await;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod communication;
pub mod config;
pub mod core;
pub mod error;
pub mod hardware;
pub mod message;

// Re-export commonly used types for easy access
pub use communication::{send_admitted, send_to, AckGate, BatchConsumer, FeederConfig, MessageChannel, OverflowPolicy, RelayBuffer};
pub use config::{ChainSettings, ChainTopology, NodeIdentity, NodeRole, PeerAddress};
pub use self::core::{bind_node, Effect, MachineState, NodeContext, NodeRunner, NodeStateMachine};
pub use error::{WaveError, WaveResult};
pub use hardware::{HardwareActuationPort, SimulatedPort};
pub use message::{Envelope, Payload, Response, SensorVector, TimeEncoding};
