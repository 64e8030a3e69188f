//! Error types for the replication protocol

use dashstore_core::DataError;
use thiserror::Error;

/// Replication error types
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The required tag is absent or false for the requested path
    #[error("access to {path} requires {tag}")]
    Forbidden {
        /// The resolved data path
        path: String,
        /// The tag the client asked for
        tag: String,
    },

    /// The peer sent something that does not fit the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer closed the connection
    #[error("connection closed")]
    Disconnected,

    /// A server message could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Repository failure on the serving side
    #[error(transparent)]
    Data(#[from] DataError),
}

impl RemoteError {
    /// True when the connection is gone and the session should end quietly.
    pub fn is_disconnect(&self) -> bool {
        match self {
            RemoteError::Disconnected => true,
            RemoteError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type alias for replication operations
pub type RemoteResult<T> = Result<T, RemoteError>;
