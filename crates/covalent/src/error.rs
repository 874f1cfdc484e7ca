//! Error types for the node.

use covalent_core::{CoId, CoValueType, CoreError, ValidationError};
use covalent_perms::PermsError;
use covalent_store::StoreError;
use covalent_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Core error (encoding, crypto).
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Permission error.
    #[error("permission error: {0}")]
    Permission(#[from] PermsError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// No peer supplied the CoValue and its dependencies.
    #[error("covalue unavailable: {0}")]
    Unavailable(CoId),

    /// The CoValue is not loaded on this node.
    #[error("covalue not loaded: {0}")]
    NotLoaded(CoId),

    /// The CoValue has a different kind than requested.
    #[error("covalue {id} is not a {expected:?}")]
    WrongKind { id: CoId, expected: CoValueType },

    /// A list or text position past the end.
    #[error("index {index} out of range in {id}")]
    IndexOutOfRange { id: CoId, index: usize },

    /// The CoValue is not a group.
    #[error("covalue {0} is not a group")]
    NotAGroup(CoId),

    /// The node has no account identity.
    #[error("node has no account")]
    NoAccount,

    /// A storage peer was lost; the node no longer accepts local writes.
    #[error("storage peer lost")]
    StorageLost,
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
