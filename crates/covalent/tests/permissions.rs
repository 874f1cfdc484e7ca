//! Groups, invites and revocation across nodes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use covalent::core_types::CryptoProvider;
use covalent::perms::PermsError;
use covalent::sync::memory::connected_pair;
use covalent::{
    CoId, LocalNode, Member, NativeCrypto, NodeConfig, NodeError, PeerRole, Role,
};

struct Trio {
    alice: LocalNode,
    bob: LocalNode,
    server: LocalNode,
}

fn node_config() -> NodeConfig {
    NodeConfig::default().with_load_timeout(Duration::from_secs(5))
}

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

async fn trio() -> Trio {
    let crypto: Arc<dyn CryptoProvider> = Arc::new(NativeCrypto);
    let (alice, _) = LocalNode::with_new_account(crypto.clone(), node_config(), "alice").unwrap();
    let (bob, _) = LocalNode::with_new_account(crypto.clone(), node_config(), "bob").unwrap();
    let server = LocalNode::with_agent(crypto, node_config(), NativeCrypto.new_agent_secret());
    connect(&alice, "alice", &server);
    connect(&bob, "bob", &server);

    let bob_account = bob.account_id().unwrap();
    wait_until(|| server.known_state(&bob_account) == bob.known_state(&bob_account)).await;
    Trio { alice, bob, server }
}

async fn synced(a: &LocalNode, b: &LocalNode, id: &CoId) {
    wait_until(|| a.known_state(id).is_some() && a.known_state(id) == b.known_state(id)).await;
}

#[tokio::test]
async fn test_member_reads_and_writes_private_map() {
    let t = trio().await;
    let group = t.alice.create_group().unwrap();
    let bob_account = t.bob.account_id().unwrap();
    t.alice
        .add_member(&group, Member::Account(bob_account), Role::Writer)
        .await
        .unwrap();

    let map = t.alice.create_map(&group).unwrap();
    t.alice.map_set(&map, "plan", json!("picnic")).unwrap();
    synced(&t.alice, &t.server, &map).await;

    t.bob.load(&map).await.unwrap();
    assert_eq!(t.bob.map(&map).unwrap().get("plan"), Some(&json!("picnic")));

    t.bob.map_set(&map, "plan", json!("museum")).unwrap();
    synced(&t.alice, &t.bob, &map).await;
    assert_eq!(t.alice.map(&map).unwrap().get("plan"), Some(&json!("museum")));
}

#[tokio::test]
async fn test_invite_admits_account() {
    let t = trio().await;
    let group = t.alice.create_group().unwrap();
    let map = t.alice.create_map(&group).unwrap();
    t.alice.map_set(&map, "welcome", json!("hi")).unwrap();
    let invite = t.alice.create_invite(&group, Role::Writer).unwrap();
    synced(&t.alice, &t.server, &group).await;
    synced(&t.alice, &t.server, &map).await;

    let role = t.bob.accept_invite(&group, invite).await.unwrap();
    assert_eq!(role, Role::Writer);
    let bob_account = Member::Account(t.bob.account_id().unwrap());
    assert_eq!(t.bob.group(&group).unwrap().role_of(&bob_account), Some(Role::Writer));

    t.bob.load(&map).await.unwrap();
    assert_eq!(t.bob.map(&map).unwrap().get("welcome"), Some(&json!("hi")));
    t.bob.map_set(&map, "reply", json!("hello")).unwrap();

    synced(&t.alice, &t.bob, &group).await;
    synced(&t.alice, &t.bob, &map).await;
    assert_eq!(t.alice.group(&group).unwrap().role_of(&bob_account), Some(Role::Writer));
    assert_eq!(t.alice.map(&map).unwrap().get("reply"), Some(&json!("hello")));
}

#[tokio::test]
async fn test_revoked_reader_loses_new_writes_only() {
    let t = trio().await;
    let group = t.alice.create_group().unwrap();
    let bob_account = t.bob.account_id().unwrap();
    t.alice
        .add_member(&group, Member::Account(bob_account), Role::Reader)
        .await
        .unwrap();
    let map = t.alice.create_map(&group).unwrap();
    t.alice.map_set(&map, "status", json!("draft")).unwrap();
    synced(&t.alice, &t.server, &map).await;
    t.bob.load(&map).await.unwrap();
    assert_eq!(t.bob.map(&map).unwrap().get("status"), Some(&json!("draft")));

    // Readers cannot write.
    assert!(matches!(
        t.bob.map_set(&map, "status", json!("hijacked")),
        Err(NodeError::Permission(PermsError::InsufficientPermission(_)))
    ));

    t.alice.remove_member(&group, Member::Account(bob_account)).unwrap();
    t.alice.map_set(&map, "status", json!("final")).unwrap();
    synced(&t.alice, &t.bob, &group).await;
    synced(&t.alice, &t.bob, &map).await;

    assert_eq!(t.alice.map(&map).unwrap().get("status"), Some(&json!("final")));
    // The new value is sealed under a key Bob never received.
    assert_eq!(t.bob.map(&map).unwrap().get("status"), Some(&json!("draft")));
    assert_eq!(
        t.bob.group(&group).unwrap().role_of(&Member::Account(bob_account)),
        Some(Role::Revoked)
    );
}

#[tokio::test]
async fn test_only_admins_manage_members() {
    let t = trio().await;
    let group = t.alice.create_group().unwrap();
    let bob_account = t.bob.account_id().unwrap();
    t.alice
        .add_member(&group, Member::Account(bob_account), Role::Writer)
        .await
        .unwrap();
    synced(&t.alice, &t.server, &group).await;
    t.bob.load(&group).await.unwrap();

    let alice_account = Member::Account(t.alice.account_id().unwrap());
    assert!(matches!(
        t.bob.remove_member(&group, alice_account),
        Err(NodeError::Permission(PermsError::InsufficientPermission(_)))
    ));
    assert!(matches!(
        t.bob.create_invite(&group, Role::Reader),
        Err(NodeError::Permission(PermsError::InsufficientPermission(_)))
    ));
    assert!(matches!(
        t.alice.add_member(&group, Member::Everyone, Role::Admin).await,
        Err(NodeError::Permission(PermsError::InvalidRole(_)))
    ));
}

#[tokio::test]
async fn test_extended_group_shares_read_access() {
    let t = trio().await;
    let bob_account = t.bob.account_id().unwrap();
    let team = t.alice.create_group().unwrap();
    t.alice
        .add_member(&team, Member::Account(bob_account), Role::Reader)
        .await
        .unwrap();

    let project = t.alice.create_group().unwrap();
    t.alice.extend_group(&project, &team).await.unwrap();
    let doc = t.alice.create_text(&project).unwrap();
    t.alice.text_insert(&doc, 0, "shared notes").unwrap();
    synced(&t.alice, &t.server, &doc).await;
    synced(&t.alice, &t.server, &project).await;

    t.bob.load(&doc).await.unwrap();
    assert_eq!(t.bob.text(&doc).unwrap().to_string(), "shared notes");
}
