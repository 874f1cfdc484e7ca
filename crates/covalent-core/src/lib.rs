//! # Covalent Core
//!
//! Pure primitives for Covalent: identifiers, signed session logs, canonical
//! encoding and the content merge engine.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over cryptographic data structures.
//!
//! ## Key Types
//!
//! - [`CoValueHeader`] - The immutable header; its canonical hash is the [`CoId`]
//! - [`SessionLog`] - One session's hash-chained, signed transaction list
//! - [`VerifiedState`] - Header plus all session logs of a CoValue
//! - [`KnownState`] - Per-session transaction counts, used to diff replicas
//! - [`CoContent`] - Materialized Map/List/Stream/PlainText content
//! - [`CryptoProvider`] - The cryptographic capability, with [`NativeCrypto`] as default
//!
//! ## Canonicalization
//!
//! Headers and transactions are hashed over deterministic CBOR. See [`canonical`].

#[macro_use]
mod macros;

pub mod canonical;
pub mod content;
pub mod crypto;
pub mod error;
pub mod header;
pub mod ids;
pub mod known_state;
pub mod session;
pub mod transaction;
pub mod validation;
pub mod verified;

pub use canonical::canonical_bytes;
pub use content::{
    CoContent, CoList, CoMap, CoPlainText, CoStream, ContentMerge, DecodedTransaction, ListAnchor,
    ListChange, MapChange,
};
pub use crypto::{
    AgentSecret, CryptoProvider, Encrypted, Hash, KeySecret, NativeCrypto, Sealed, Signature,
    StreamingHasher,
};
pub use error::{CoreError, ValidationError};
pub use header::{CoValueHeader, CoValueType, Ruleset};
pub use ids::{
    AccountOrAgent, AgentId, CoId, KeyId, Member, OpId, SealerId, SessionId, SignerId,
    TransactionId,
};
pub use known_state::KnownState;
pub use session::{AppendOutcome, SessionLog, SessionNewContent, MAX_RECOMMENDED_TX_SIZE};
pub use transaction::{encryption_context, Transaction};
pub use validation::{validate_header, validate_session_batch};
pub use verified::{ContentPiece, TxRef, VerifiedState};
