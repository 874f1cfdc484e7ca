//! # Covalent
//!
//! The unified API for Covalent, a local-first sync engine: collaborative
//! values that replicate between nodes, with permissions and encryption
//! carried inside the data itself.
//!
//! ## Overview
//!
//! A [`LocalNode`] provides:
//!
//! - **CoValues**: Maps, lists, streams and plain text built from signed,
//!   hash-chained session logs
//! - **Groups**: Role tables and read keys that decide who may write and read
//! - **Accounts**: Groups that stand for a user, with a profile and a root
//! - **Sync**: A load/known/content/done protocol with peers and storage
//!
//! ## Key Types
//!
//! - [`LocalNode`] - A replica with an identity, a session and its peers
//! - [`CoValueCore`] - One CoValue's verified log
//! - [`Registry`] - Every CoValue a node holds
//! - [`NodeConfig`] - Timeouts and sync settings
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use covalent::{LocalNode, NodeConfig};
//! use covalent::core_types::NativeCrypto;
//! use covalent::store::{SqliteStore, StoragePeer};
//! use covalent::sync::PeerId;
//! use serde_json::json;
//!
//! async fn example() {
//!     let (node, _secret) =
//!         LocalNode::with_new_account(Arc::new(NativeCrypto), NodeConfig::default(), "alice")
//!             .unwrap();
//!
//!     // Persist everything through a storage peer
//!     let store = Arc::new(SqliteStore::open("covalues.db").unwrap());
//!     node.add_peer(StoragePeer::spawn(store, PeerId::new("storage")));
//!
//!     // A private map owned by a new group
//!     let group = node.create_group().unwrap();
//!     let todo = node.create_map(&group).unwrap();
//!     node.map_set(&todo, "title", json!("groceries")).unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Verify on arrival, judge on read**: incoming batches are checked for
//!   hashes and signatures; whether a transaction counts is decided against
//!   the group when content is materialized
//! - **One lock**: node state sits behind a single mutex that is never held
//!   across an await
//! - **Storage is a peer**: persistence goes through the sync protocol;
//!   losing a storage peer disables local writes
//!
//! ## Re-exports
//!
//! - `covalent::core_types` - Identifiers, headers, sessions and content
//! - `covalent::perms` - Groups, roles, keys and invites
//! - `covalent::store` - Storage and the storage peer
//! - `covalent::sync` - Messages, peers and transports

pub mod config;
pub mod covalue;
pub mod error;
pub mod node;
mod sync_manager;

// Re-export component crates
pub use covalent_core as core_types;
pub use covalent_perms as perms;
pub use covalent_store as store;
pub use covalent_sync as sync;

// Re-export main types for convenience
pub use config::NodeConfig;
pub use covalue::{CoValueCore, Registry};
pub use error::{NodeError, Result};
pub use node::{LocalNode, Privacy};

// Re-export commonly used types
pub use covalent_core::{
    AgentSecret, CoContent, CoId, CoList, CoMap, CoPlainText, CoStream, CoValueHeader, CoValueType,
    Member, NativeCrypto,
};
pub use covalent_perms::Role;
pub use covalent_sync::{Peer, PeerId, PeerRole};

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
