//! Test fixtures and helpers.
//!
//! Common setup code for multi-node tests: accounts, links between nodes
//! that can be cut and healed, and polling for eventual conditions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::sync::{mpsc, watch};

use covalent::sync::{Peer, PeerEvent, PeerId, PeerRole, SyncMessage, DEFAULT_OUTGOING_CAPACITY};
use covalent::{AgentSecret, CoId, LocalNode, NodeConfig};
use covalent_core::{CryptoProvider, NativeCrypto};

/// Load timeout used by test nodes.
pub const TEST_LOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// The crypto provider used by test nodes.
pub fn crypto() -> Arc<dyn CryptoProvider> {
    Arc::new(NativeCrypto)
}

pub fn test_config() -> NodeConfig {
    NodeConfig::default().with_load_timeout(TEST_LOAD_TIMEOUT)
}

/// A node with a fresh account.
pub fn new_account(name: &str) -> anyhow::Result<(LocalNode, AgentSecret)> {
    LocalNode::with_new_account(crypto(), test_config(), name)
        .with_context(|| format!("creating account {name}"))
}

/// A node acting as a bare agent, like a sync server.
pub fn new_agent_node() -> LocalNode {
    LocalNode::with_agent(crypto(), test_config(), NativeCrypto.new_agent_secret())
}

/// Install a test-writer tracing subscriber; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A bidirectional link whose traffic can be held back.
///
/// While cut, messages queue up in order; healing delivers them.
#[derive(Clone)]
pub struct Link {
    open: Arc<watch::Sender<bool>>,
}

impl Link {
    pub fn cut(&self) {
        self.open.send_replace(false);
    }

    pub fn heal(&self) {
        self.open.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }
}

/// Connect `client` to `server` over a [`Link`].
///
/// The client sees the server as an upstream `Server` peer; the server sees
/// the client as a `Client` peer. Must be called within a tokio runtime.
pub fn link(client: &LocalNode, client_id: &str, server: &LocalNode, server_id: &str) -> Link {
    let (open_tx, open_rx) = watch::channel(true);
    let (to_server, from_client) = pipe(open_rx.clone());
    let (to_client, from_server) = pipe(open_rx);

    client.add_peer(Peer::from_channels(
        PeerId::new(server_id),
        PeerRole::Server,
        from_server,
        to_server,
    ));
    server.add_peer(Peer::from_channels(
        PeerId::new(client_id),
        PeerRole::Client,
        from_client,
        to_client,
    ));
    Link {
        open: Arc::new(open_tx),
    }
}

/// A one-way channel forwarding messages only while the link is open.
fn pipe(mut open: watch::Receiver<bool>) -> (mpsc::Sender<SyncMessage>, mpsc::Receiver<PeerEvent>) {
    let (tx, mut rx) = mpsc::channel::<SyncMessage>(DEFAULT_OUTGOING_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(DEFAULT_OUTGOING_CAPACITY);
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if open.wait_for(|open| *open).await.is_err() {
                break;
            }
            if event_tx.send(PeerEvent::Message(message)).await.is_err() {
                return;
            }
        }
        let _ = event_tx.send(PeerEvent::Disconnected).await;
    });
    (tx, event_rx)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until every node holds the same known state for `id`.
pub async fn wait_synced(nodes: &[&LocalNode], id: &CoId) -> anyhow::Result<()> {
    eventually(TEST_LOAD_TIMEOUT, || {
        let first = nodes[0].known_state(id);
        first.is_some() && nodes.iter().all(|node| node.known_state(id) == first)
    })
    .await
    .with_context(|| format!("nodes did not converge on {id}"))
}
