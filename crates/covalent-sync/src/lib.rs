//! # Covalent Sync
//!
//! Wire protocol, peer transports and priority scheduling.
//!
//! ## Overview
//!
//! Replicas converge by exchanging four messages per CoValue. Each side
//! tracks what the other holds ([`PeerState`]) and sends only the
//! difference. Outgoing messages are scheduled by a
//! [`PriorityBasedMessageQueue`] so that groups and accounts travel ahead of
//! the content that depends on them, without starving bulky streams.
//!
//! ## Key Properties
//!
//! - **Idempotent**: Content already held is skipped on receipt
//! - **Commutative**: Sessions may arrive in any interleaving
//! - **Resumable**: Known states are exchanged again after reconnecting
//! - **Bandwidth-efficient**: Only transactions the peer lacks are sent
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covalent_sync::{memory::connected_pair, PeerRole};
//!
//! async fn example() {
//!     // let (server_for_client, client_for_server) =
//!     //     connected_pair("client", "server", PeerRole::Client, PeerRole::Server);
//!     // client_node.add_peer(server_for_client);
//!     // server_node.add_peer(client_for_server);
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- load (A's known) ------->|
//!   |<------- known (B's known) -------|
//!   |<------- content (A lacks) -------|
//!   |-------- content (B lacks) ------>|
//!   |<------- known (ack) -------------|
//!   |-------- known (ack) ------------>|
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod peer_state;
pub mod queue;
pub mod transport;

pub use codec::{decode_frame, encode_frame, FrameReader, FrameWriter};
pub use error::{Result, SyncError};
pub use messages::{ContentMessage, DoneMessage, KnownMessage, Priority, SyncMessage};
pub use peer_state::{CoValuePeerState, PeerState, PeerStats, SyncPhase};
pub use queue::{run_dispatcher, Dispatch, Pending, PriorityBasedMessageQueue};
pub use transport::{
    memory, Peer, PeerConnector, PeerEvent, PeerId, PeerRole, ReconnectPolicy, StreamOptions,
    DEFAULT_OUTGOING_CAPACITY,
};

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Capacity of each peer's outgoing channel.
    pub outgoing_capacity: usize,
    /// Backoff used when reconnecting to upstream peers.
    pub reconnect: ReconnectPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            outgoing_capacity: DEFAULT_OUTGOING_CAPACITY,
            reconnect: ReconnectPolicy::default(),
        }
    }
}
