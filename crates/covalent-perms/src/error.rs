//! Error types for the permissions module.

use thiserror::Error;

use covalent_core::{CoId, KeyId};

/// Errors that can occur during permission operations.
#[derive(Debug, Error)]
pub enum PermsError {
    /// The author lacks the role needed for an operation.
    #[error("insufficient permission: {0}")]
    InsufficientPermission(String),

    /// The group needed to evaluate permissions is not loaded.
    #[error("group not available: {0}")]
    GroupUnavailable(CoId),

    /// The CoValue is not a group.
    #[error("not a group: {0}")]
    NotAGroup(CoId),

    /// The account has no agent with the admin role.
    #[error("account {0} has no current agent")]
    NoCurrentAgent(CoId),

    /// No way to obtain the secret for a read key.
    #[error("read key {0} is not available to this agent")]
    MissingReadKey(KeyId),

    /// The group has no read key yet.
    #[error("group {0} has no read key")]
    NoReadKey(CoId),

    /// Unknown role string.
    #[error("invalid role: {0}")]
    InvalidRole(String),

    /// Decryption error.
    #[error("decryption error: {0}")]
    DecryptionError(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Core error.
    #[error("core error: {0}")]
    CoreError(#[from] covalent_core::CoreError),
}

impl From<serde_json::Error> for PermsError {
    fn from(e: serde_json::Error) -> Self {
        PermsError::SerializationError(e.to_string())
    }
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
