//! Errors raised by CoValue stores.

use thiserror::Error;

/// Failure of a [`Store`](crate::Store) call.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite rejected a statement.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored header or transaction did not round-trip through JSON.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Nothing is stored under this id.
    #[error("covalue not found: {0}")]
    NotFound(String),

    /// A different header is already stored under the same id.
    #[error("conflicting header for {0}")]
    Conflict(String),

    /// Stored rows that fail verification.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The schema could not be brought to the current version.
    #[error("migration error: {0}")]
    Migration(String),

    /// The blocking storage task failed.
    #[error("storage task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<covalent_core::CoreError> for StoreError {
    fn from(e: covalent_core::CoreError) -> Self {
        StoreError::InvalidData(e.to_string())
    }
}

/// Result alias for store calls.
pub type Result<T> = std::result::Result<T, StoreError>;
