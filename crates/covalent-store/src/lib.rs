//! # Covalent Store
//!
//! Storage abstraction for Covalent. Provides a trait-based interface for
//! CoValue persistence with SQLite and in-memory implementations, and a
//! storage peer that lets a node sync with its store like with any peer.
//!
//! ## Overview
//!
//! The store keeps, per CoValue, the header and each session's
//! transactions together with the signatures that checkpoint them. It does
//! not verify anything: the node only forwards content it has accepted.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`StoragePeer`] - Serves a store over the sync protocol
//! - [`AppendResult`] - Result of appending a batch
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use covalent_store::{SqliteStore, StoragePeer};
//! use covalent_sync::PeerId;
//!
//! async fn example() {
//!     let store = Arc::new(SqliteStore::open("covalues.db").unwrap());
//!     let peer = StoragePeer::spawn(store, PeerId::new("storage"));
//!     // node.add_peer(peer);
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent appends**: Re-sending stored transactions returns `AlreadyKnown`
//! - **Gap detection**: A batch starting past the stored count is refused
//! - **Corrections**: The storage peer answers gaps with a correcting `known`

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod storage_peer;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use storage_peer::StoragePeer;
pub use traits::{AppendResult, Store, StoreExt, StoredBatch};

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
