//! # Network side of a wavechain node
//!
//! - **framing**: 4-byte little-endian length prefix around each JSON message
//! - **channel**: single-slot envelope server and the short-lived `send_to` client
//! - **relay_buffer**: bounded FIFO for triggers that arrive mid-cycle
//! - **ack_gate** / **consumer**: both ends of the row-by-row batch handshake
//!
//! ## Usage
//!
//! ```rust,no_run
//! use wavechain_core::communication::send_to;
//! use wavechain_core::config::PeerAddress;
//! use wavechain_core::message::Envelope;
//! use std::time::Duration;
//!
//! # async fn demo() -> wavechain_core::WaveResult<()> {
//! let peer = PeerAddress::new("res02", "127.0.0.1", 8766);
//! let response = send_to(&peer, &Envelope::status_request(), Duration::from_secs(5)).await?;
//! println!("{} is {:?}", peer, response.state);
//! # Ok(())
//! # }
//! ```

pub mod ack_gate;
pub mod channel;
pub mod consumer;
pub mod framing;
pub mod relay_buffer;

pub use ack_gate::{AckGate, BatchReport, FeederConfig, FeederState, ReadyListener};
pub use channel::{send_admitted, send_to, EnvelopeHandler, MessageChannel, ServerHandle};
pub use consumer::BatchConsumer;
pub use relay_buffer::{OverflowPolicy, PushOutcome, RelayBuffer};
