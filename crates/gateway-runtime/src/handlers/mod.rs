//! # Message Handlers
//!
//! Application handlers registered with the gateway at start-up.

pub mod execution;
pub mod heartbeat;

pub use execution::ExecutionRequestHandler;
pub use heartbeat::{HeartBeatRecord, HeartBeatTracker};
