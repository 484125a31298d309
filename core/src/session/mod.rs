//! Session state machine driving one module server connection.

pub mod cancel;
pub mod client;
pub mod sequence;

use serde::Serialize;

use crate::protocol::{ProtocolError, ServerError};

pub use cancel::CancelHandle;
pub use client::{Client, ClientConfig};
pub use sequence::{SequenceCheck, SequenceTracker, TickUnwrapper};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Idle,
    Configured,
    Streaming,
    Stopping,
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("config rejected: {0}")]
    ConfigRejected(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("session cancelled")]
    Cancelled,
    #[error("{operation} is not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("server error {:?}: {}", .0.code, .0.message)]
    Server(ServerError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
