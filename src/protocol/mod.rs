//! The worker wire protocol.
//!
//! Frames are a 4-byte little-endian length followed by a UTF-8 payload. A
//! connection opens with a version handshake, after which the worker sends
//! JSON requests and the server answers each one except result publication.

pub mod codec;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;

use std::time::Duration;

use thiserror::Error;

pub use codec::{frame_codec, FrameStream, MAX_FRAME_LENGTH};
pub use message::{
    Request, TaskResponse, MALFORMED_REQUEST, PROTOCOL_MATCH, PROTOCOL_VERSION,
    UNKNOWN_REQUEST, VERSION_MISMATCH, WAITING_OK,
};
pub use registry::{SessionInfo, SessionRegistry};
pub use server::WorkerServer;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol version mismatch: expected {expected}, got {received}")]
    VersionMismatch { expected: String, received: String },

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unknown request: {0}")]
    UnknownRequest(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("no frame received for {0:?}")]
    Timeout(Duration),
}
