//! Error types for the gateway subsystem.

use thiserror::Error;

use crate::close::CloseCode;

/// Errors surfaced by shard connections and the orchestrator.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The socket could not be opened or failed mid-stream.
    #[error("failed to connect to server: {reason:?}")]
    Connection {
        /// Underlying failure description.
        reason: String,
    },

    /// The server closed the connection.
    #[error("server closed connection with code {code} ({reason})")]
    ServerClosed {
        /// Close code sent by the server.
        code: CloseCode,
        /// Close reason sent by the server.
        reason: String,
        /// False when the code is fatal and reconnecting would not help.
        can_reconnect: bool,
    },

    /// The server broke the frame contract.
    #[error("protocol violation: {reason}")]
    Protocol {
        /// What was wrong.
        reason: String,
    },

    /// Heartbeats went unacknowledged.
    #[error("connection zombied after missed heartbeat acks")]
    Zombied,

    /// The server invalidated the session (op 9).
    #[error("session invalidated (resumable={resumable})")]
    InvalidSession {
        /// Whether the session may be resumed.
        resumable: bool,
    },

    /// The server asked for a reconnect (op 7).
    #[error("server requested a reconnect")]
    ReconnectRequested,

    /// The operation is not valid in the component's current state.
    #[error("{reason}")]
    StateConflict {
        /// What conflicted.
        reason: String,
    },

    /// Frame encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An OS-level failure, such as installing a signal handler.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled by a stop request.
    #[error("operation cancelled")]
    Cancelled,

    /// A process interrupt signal was received.
    #[error("signal {signum} ({signame}) received")]
    Interrupted {
        /// Signal number.
        signum: i32,
        /// Signal name.
        signame: String,
    },
}

impl GatewayError {
    /// Shorthand for [`GatewayError::StateConflict`].
    pub fn conflict(reason: impl Into<String>) -> Self {
        GatewayError::StateConflict {
            reason: reason.into(),
        }
    }

    /// True if the shard must not reconnect after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            GatewayError::ServerClosed { can_reconnect, .. } => !can_reconnect,
            GatewayError::StateConflict { .. } => true,
            GatewayError::Interrupted { .. } => true,
            _ => false,
        }
    }
}

/// Returns true for errors a shard recovers from by reconnecting.
pub fn is_retryable(error: &GatewayError) -> bool {
    match error {
        GatewayError::Connection { .. } => true,
        GatewayError::ServerClosed { can_reconnect, .. } => *can_reconnect,
        GatewayError::Protocol { .. } => true,
        GatewayError::Zombied => true,
        GatewayError::InvalidSession { .. } => true,
        GatewayError::ReconnectRequested => true,
        GatewayError::Serialization(_) => true,
        GatewayError::StateConflict { .. } => false,
        GatewayError::Io(_) => false,
        GatewayError::Cancelled => false,
        GatewayError::Interrupted { .. } => false,
    }
}

/// Result type alias using GatewayError as the error type.
pub type Result<T> = std::result::Result<T, GatewayError>;
