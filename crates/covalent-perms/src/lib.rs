//! # Covalent Permissions
//!
//! Groups, roles, read keys and the permission resolver.
//!
//! ## Overview
//!
//! Access control is expressed as data. A group is a CoMap of member roles
//! and key revelations; its state is computed by folding its transactions in
//! merge order. Every other CoValue is owned by a group, and its transactions
//! are valid only if their author could write to that group at the time the
//! transaction was made.
//!
//! ## Key Concepts
//!
//! - **Role**: admin, writer, reader, revoked, or one of the invite roles
//! - **GroupState**: The folded role table, read key and parent links of a group
//! - **PermissionResolver**: Decides which transactions of a CoValue are valid
//! - **KeyResolver**: Finds read key secrets and produces key rotations
//!
//! ## Encryption Model
//!
//! Private transactions are encrypted with the owning group's read key:
//!
//! 1. **Read Key**: A symmetric key (ChaCha20-Poly1305) named by the group's `readKey`
//! 2. **Revelations**: The key is sealed to each member's agent (X25519), given to
//!    `everyone` in the clear, or encrypted under another key
//!
//! Revocation rotates the read key. The revoked member keeps the keys it
//! already had, and so keeps access to history, but cannot read anything
//! written after the rotation.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covalent_perms::{Identity, KeyResolver, PermissionResolver};
//!
//! // let perms = PermissionResolver::new(&states);
//! // let valid = perms.valid_transactions(&state);
//!
//! // let keys = KeyResolver::new(&perms, &crypto, &me);
//! // let (key, secret) = keys.current_read_key(&group)?;
//! ```

pub mod account;
pub mod envelope;
pub mod error;
pub mod group;
pub mod invite;
pub mod keys;
pub mod resolver;
pub mod role;

pub use account::{profile_id, root_id, Identity, PROFILE_KEY, ROOT_KEY};
pub use envelope::{decode_transactions, key_group, open_changes, seal_changes};
pub use error::{PermsError, Result};
pub use group::{parent_key, read_key_key, revelation_key, GroupKey, GroupState};
pub use invite::{accept_invite, create_invite};
pub use keys::{revelation_context, KeyResolver};
pub use resolver::{CoValueLookup, PermissionResolver};
pub use role::Role;
