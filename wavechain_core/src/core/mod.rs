//! # Node state machine
//!
//! - **state**: the closed set of machine states and the transition history
//! - **context**: per-node identity, route, relay buffer and timing settings
//! - **machine**: synchronous handlers returning the effect to wait on next
//! - **runner**: async loop that owns the machine and feeds it inbound envelopes
//!
//! ## Cycle
//!
//! 1. IDLE: wait out the post-send cooldown, then drain one buffered envelope
//! 2. COLLECT_SIGNAL (sensing nodes only): take a vector from the port
//! 3. DRIVE_WAVEMAKER: play the vector, hardware failures are logged only
//! 4. SEND_DATA: forward to the next hop, back to IDLE either way

pub mod context;
pub mod machine;
pub mod runner;
pub mod state;

pub use context::{NodeContext, Route};
pub use machine::{Effect, NodeStateMachine};
pub use runner::{bind_node, Inbound, NodeHandler, NodeRunner};
pub use state::{MachineState, Transition, TransitionHistory};
