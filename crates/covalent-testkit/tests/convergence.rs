//! Replicas that edit the same CoValue while partitioned converge once
//! their links heal.

use std::time::Duration;

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use serde_json::Value;

use covalent::core_types::ContentMerge;
use covalent::{CoId, CoValueHeader, CoValueType, LocalNode, Member, Role};
use covalent_testkit::fixtures::{eventually, link, new_account, new_agent_node, wait_synced};
use covalent_testkit::generators::{content_kind, edit_script};
use covalent_testkit::EditOp;

struct Network {
    alice: LocalNode,
    bob: LocalNode,
    server: LocalNode,
    links: Vec<covalent_testkit::Link>,
}

/// Alice and Bob, both writers of a group, connected through a server.
async fn network() -> anyhow::Result<(Network, CoId)> {
    let (alice, _) = new_account("alice")?;
    let (bob, _) = new_account("bob")?;
    let server = new_agent_node();
    let links = vec![
        link(&alice, "alice", &server, "server"),
        link(&bob, "bob", &server, "server"),
    ];

    let bob_account = bob.account_id().ok_or_else(|| anyhow::anyhow!("bob has no account"))?;
    eventually(Duration::from_secs(5), || server.is_loaded(&bob_account)).await?;

    let group = alice.create_group()?;
    alice
        .add_member(&group, Member::Account(bob_account), Role::Writer)
        .await?;
    Ok((
        Network {
            alice,
            bob,
            server,
            links,
        },
        group,
    ))
}

fn content_json(node: &LocalNode, id: &CoId) -> anyhow::Result<Value> {
    Ok(node.content(id)?.to_json())
}

async fn partitioned_edits(
    kind: CoValueType,
    alice_edits: Vec<EditOp>,
    bob_edits: Vec<EditOp>,
) -> anyhow::Result<()> {
    let (net, group) = network().await?;
    let id = net.alice.create_covalue(CoValueHeader::owned_by(kind, group, None, 0))?;
    wait_synced(&[&net.alice, &net.server], &id).await?;
    net.bob.load(&id).await?;

    for link in &net.links {
        link.cut();
    }
    for op in &alice_edits {
        op.apply(&net.alice, &id)?;
    }
    for op in &bob_edits {
        op.apply(&net.bob, &id)?;
    }
    for link in &net.links {
        link.heal();
    }

    wait_synced(&[&net.alice, &net.bob, &net.server], &id).await?;
    anyhow::ensure!(
        content_json(&net.alice, &id)? == content_json(&net.bob, &id)?,
        "replicas disagree on {id}"
    );
    Ok(())
}

fn run(future: impl std::future::Future<Output = anyhow::Result<()>>) -> Result<(), TestCaseError> {
    let runtime = tokio::runtime::Runtime::new().map_err(|e| TestCaseError::fail(e.to_string()))?;
    runtime
        .block_on(future)
        .map_err(|e| TestCaseError::fail(format!("{e:#}")))
}

fn kind_and_scripts() -> impl Strategy<Value = (CoValueType, Vec<EditOp>, Vec<EditOp>)> {
    content_kind().prop_flat_map(|kind| (Just(kind), edit_script(kind, 6), edit_script(kind, 6)))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn test_partitioned_replicas_converge((kind, alice, bob) in kind_and_scripts()) {
        run(partitioned_edits(kind, alice, bob))?;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_map_writes_pick_one_winner() {
    let (net, group) = network().await.unwrap();
    let map = net.alice.create_map(&group).unwrap();
    wait_synced(&[&net.alice, &net.server], &map).await.unwrap();
    net.bob.load(&map).await.unwrap();

    for link in &net.links {
        link.cut();
    }
    net.alice.map_set(&map, "color", serde_json::json!("red")).unwrap();
    net.bob.map_set(&map, "color", serde_json::json!("blue")).unwrap();
    for link in &net.links {
        link.heal();
    }

    wait_synced(&[&net.alice, &net.bob], &map).await.unwrap();
    let a = net.alice.map(&map).unwrap().get("color").cloned();
    let b = net.bob.map(&map).unwrap().get("color").cloned();
    assert_eq!(a, b);
    assert!(a.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_text_edits_interleave_without_loss() {
    let (net, group) = network().await.unwrap();
    let text = net.alice.create_text(&group).unwrap();
    net.alice.text_insert(&text, 0, "hello").unwrap();
    wait_synced(&[&net.alice, &net.server], &text).await.unwrap();
    net.bob.load(&text).await.unwrap();

    for link in &net.links {
        link.cut();
    }
    net.alice.text_insert(&text, 0, ">> ").unwrap();
    net.bob.text_insert(&text, 5, "!").unwrap();
    for link in &net.links {
        link.heal();
    }

    wait_synced(&[&net.alice, &net.bob], &text).await.unwrap();
    assert_eq!(net.alice.text(&text).unwrap().to_string(), ">> hello!");
    assert_eq!(net.bob.text(&text).unwrap().to_string(), ">> hello!");
}
