//! Worker side of the protocol.
//!
//! - [`WorkerClient`]: connects, performs the version handshake and issues requests
//! - [`HeartbeatSender`]: keeps a running test alive until the scheduler says stop
//!
//! Running the test command itself is left to the caller.

pub mod client;
pub mod heartbeat;

pub use client::{Transport, WorkerClient};
pub use heartbeat::HeartbeatSender;
