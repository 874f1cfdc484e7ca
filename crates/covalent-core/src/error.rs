//! Error types for Covalent Core.

use thiserror::Error;

use crate::ids::{CoId, SessionId};

/// Core errors that can occur while encoding, hashing or decrypting.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid id {value:?}: {reason}")]
    InvalidId { value: String, reason: String },

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),
}

impl CoreError {
    pub(crate) fn invalid_id(value: &str, reason: impl Into<String>) -> Self {
        CoreError::InvalidId {
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Validation errors for incoming transactions and headers.
///
/// These are values, never panics: a hostile peer can only get its own
/// batch rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("hash mismatch in session {session}: expected {expected}, computed {computed}")]
    HashMismatch {
        session: SessionId,
        expected: String,
        computed: String,
    },

    #[error("invalid signature for session {0}")]
    InvalidSignature(SessionId),

    #[error("session {session} has {known} transactions, batch starts after {after}")]
    SessionGap {
        session: SessionId,
        known: u32,
        after: u32,
    },

    #[error("header does not hash to {0}")]
    HeaderMismatch(CoId),

    #[error("empty transaction batch for session {0}")]
    EmptyBatch(SessionId),

    #[error("structural error: {0}")]
    StructuralError(String),
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        ValidationError::StructuralError(e.to_string())
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
