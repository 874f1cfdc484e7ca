//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A frame could not be parsed as a sync message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The peer was torn down before the operation completed.
    #[error("peer disconnected")]
    Disconnected,

    /// The peer stopped sending anything within the idle timeout.
    #[error("ping timeout")]
    PingTimeout,

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O error on a stream transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for a peer.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::MalformedMessage(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
