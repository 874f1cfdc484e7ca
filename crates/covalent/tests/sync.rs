//! Node-to-node and node-to-storage synchronization.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use covalent::core_types::{CryptoProvider, KnownState};
use covalent::store::{MemoryStore, SqliteStore, Store, StoragePeer};
use covalent::sync::memory::connected_pair;
use covalent::sync::{PeerConnector, ReconnectPolicy, SyncError};
use covalent::{
    CoId, LocalNode, NativeCrypto, NodeConfig, NodeError, Peer, PeerId, PeerRole,
};

fn crypto() -> Arc<dyn CryptoProvider> {
    Arc::new(NativeCrypto)
}

fn config() -> NodeConfig {
    NodeConfig::default().with_load_timeout(Duration::from_secs(5))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn account(name: &str) -> (LocalNode, covalent::AgentSecret) {
    LocalNode::with_new_account(crypto(), config(), name).unwrap()
}

/// `client` sees `server` as an upstream server; `name` identifies the
/// client on the server.
fn connect(client: &LocalNode, name: &str, server: &LocalNode) {
    let (server_for_client, client_for_server) =
        connected_pair(name, "server", PeerRole::Client, PeerRole::Server);
    client.add_peer(server_for_client);
    server.add_peer(client_for_server);
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

async fn wait_stored(store: &dyn Store, id: &CoId, expected: &KnownState) {
    for _ in 0..500 {
        if store.known_state(id).await.unwrap() == *expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("store did not catch up on {id}");
}

#[tokio::test]
async fn test_two_nodes_share_a_map() {
    init_tracing();
    let (alice, _) = account("alice");
    let server = LocalNode::with_agent(crypto(), config(), NativeCrypto.new_agent_secret());
    connect(&alice, "alice", &server);

    let group = alice.create_group().unwrap();
    let map = alice.create_map(&group).unwrap();
    alice.map_set(&map, "title", json!("groceries")).unwrap();

    wait_until(|| server.known_state(&map) == alice.known_state(&map)).await;
    // The server relays without being able to read.
    assert!(server.map(&map).unwrap().get("title").is_none());

    alice.map_set(&map, "title", json!("errands")).unwrap();
    wait_until(|| server.known_state(&map) == alice.known_state(&map)).await;
    let stats = alice.peer_stats(&PeerId::new("server")).unwrap();
    assert!(stats.content_out >= 2);
    assert_eq!(stats.rejected, 0);
}

#[tokio::test]
async fn test_account_reloads_from_storage() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("covalues.db")).unwrap());

    let (alice, secret) = account("alice");
    let account_id = alice.account_id().unwrap();
    alice.add_peer(StoragePeer::spawn(store.clone(), PeerId::new("storage")));

    let group = alice.create_group().unwrap();
    let list = alice.create_list(&group).unwrap();
    alice.list_append(&list, json!("milk")).unwrap();
    alice.list_append(&list, json!("eggs")).unwrap();
    alice.set_root(&list).unwrap();

    wait_stored(store.as_ref(), &list, &alice.known_state(&list).unwrap()).await;
    wait_stored(store.as_ref(), &account_id, &alice.known_state(&account_id).unwrap()).await;
    drop(alice);

    let reopened = LocalNode::with_loaded_account(
        crypto(),
        config(),
        account_id,
        secret,
        vec![StoragePeer::spawn(store.clone(), PeerId::new("storage"))],
    )
    .await
    .unwrap();

    assert_eq!(reopened.root_id().unwrap(), Some(list));
    reopened.load(&list).await.unwrap();
    assert_eq!(
        reopened.list(&list).unwrap().values(),
        vec![json!("milk"), json!("eggs")]
    );
    let profile = reopened.profile_id().unwrap().unwrap();
    assert_eq!(reopened.map(&profile).unwrap().get("name"), Some(&json!("alice")));
}

#[tokio::test]
async fn test_wrong_agent_cannot_log_in() {
    let store = Arc::new(MemoryStore::new());
    let (alice, _) = account("alice");
    let account_id = alice.account_id().unwrap();
    alice.add_peer(StoragePeer::spawn(store.clone(), PeerId::new("storage")));
    wait_stored(store.as_ref(), &account_id, &alice.known_state(&account_id).unwrap()).await;

    let result = LocalNode::with_loaded_account(
        crypto(),
        config(),
        account_id,
        NativeCrypto.new_agent_secret(),
        vec![StoragePeer::spawn(store, PeerId::new("storage"))],
    )
    .await;
    assert!(matches!(result, Err(NodeError::Permission(_))));
}

#[tokio::test]
async fn test_unknown_covalue_is_unavailable() {
    let (alice, _) = account("alice");
    let server = LocalNode::with_agent(crypto(), config(), NativeCrypto.new_agent_secret());
    connect(&alice, "alice", &server);

    let missing = CoId([42; 32]);
    let result = alice.load(&missing).await;
    assert!(matches!(result, Err(NodeError::Unavailable(id)) if id == missing));
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let (alice, _) = {
        let config = NodeConfig::default().with_load_timeout(Duration::from_millis(200));
        LocalNode::with_new_account(crypto(), config, "alice").unwrap()
    };
    // A server that never answers.
    let (_event_tx, event_rx) = mpsc::channel(16);
    let (message_tx, _message_rx) = mpsc::channel(16);
    alice.add_peer(Peer::from_channels(
        PeerId::new("silent"),
        PeerRole::Server,
        event_rx,
        message_tx,
    ));

    let started = tokio::time::Instant::now();
    let result = alice.load(&CoId([1; 32])).await;
    assert!(matches!(result, Err(NodeError::Unavailable(_))));
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_losing_storage_disables_writes() {
    init_tracing();
    let (alice, _) = account("alice");
    let group = alice.create_group().unwrap();
    let map = alice.create_map(&group).unwrap();

    let (event_tx, event_rx) = mpsc::channel(16);
    let (message_tx, _message_rx) = mpsc::channel(16);
    alice.add_peer(
        Peer::from_channels(PeerId::new("storage"), PeerRole::Storage, event_rx, message_tx)
            .with_crash_on_close(true),
    );
    alice.map_set(&map, "before", json!(1)).unwrap();

    drop(event_tx);
    wait_until(|| alice.is_failed()).await;
    assert!(matches!(
        alice.map_set(&map, "after", json!(2)),
        Err(NodeError::StorageLost)
    ));
    assert!(alice.peers().is_empty());
}

#[tokio::test]
async fn test_load_deep_follows_references() {
    let (alice, _) = account("alice");
    let server = LocalNode::with_agent(crypto(), config(), NativeCrypto.new_agent_secret());
    connect(&alice, "alice", &server);

    let group = alice.create_group().unwrap();
    alice
        .add_member(&group, covalent::Member::Everyone, covalent::Role::Reader)
        .await
        .unwrap();
    let inner = alice.create_map(&group).unwrap();
    alice.map_set(&inner, "leaf", json!(true)).unwrap();
    let outer = alice.create_map(&group).unwrap();
    alice.map_set(&outer, "child", json!(inner.to_string())).unwrap();
    wait_until(|| {
        server.known_state(&outer) == alice.known_state(&outer)
            && server.known_state(&inner) == alice.known_state(&inner)
    })
    .await;

    let (reader, _) = account("reader");
    connect(&reader, "reader", &server);
    reader.load_deep(&outer).await.unwrap();
    assert!(reader.is_loaded(&inner));
    assert_eq!(reader.map(&inner).unwrap().get("leaf"), Some(&json!(true)));
}

struct ServerConnector {
    server: LocalNode,
    attempts: AtomicU32,
}

#[async_trait]
impl PeerConnector for ServerConnector {
    async fn connect(&self) -> covalent::sync::Result<Peer> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(SyncError::Transport("refused".into()));
        }
        let (for_client, for_server) =
            connected_pair("client", "server", PeerRole::Client, PeerRole::Server);
        self.server.add_peer(for_server);
        Ok(for_client)
    }
}

#[tokio::test]
async fn test_connect_upstream_retries() {
    let mut config = config();
    config.sync.reconnect = ReconnectPolicy {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        max_attempts: Some(5),
    };
    let (alice, _) = LocalNode::with_new_account(crypto(), config, "alice").unwrap();
    let server = LocalNode::with_agent(crypto(), NodeConfig::default(), NativeCrypto.new_agent_secret());
    let connector = Arc::new(ServerConnector {
        server: server.clone(),
        attempts: AtomicU32::new(0),
    });

    let task = alice.connect_upstream(connector.clone());
    let account_id = alice.account_id().unwrap();
    wait_until(|| server.known_state(&account_id) == alice.known_state(&account_id)).await;
    assert!(connector.attempts.load(Ordering::SeqCst) >= 2);
    task.abort();
}
