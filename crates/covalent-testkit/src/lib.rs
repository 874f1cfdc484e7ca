//! # Covalent Testkit
//!
//! Testing utilities for Covalent.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Generators**: Proptest strategies for transactions and edit scripts
//! - **Fixtures**: Accounts, cuttable links between nodes, and polling helpers
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use covalent_core::{CoContent, CoValueType, ContentMerge};
//! use covalent_testkit::generators::map_transactions;
//!
//! proptest! {
//!     #[test]
//!     fn merge_is_deterministic(txs in map_transactions()) {
//!         let a = CoContent::from_transactions(CoValueType::Comap, &txs).to_json();
//!         let b = CoContent::from_transactions(CoValueType::Comap, &txs).to_json();
//!         prop_assert_eq!(a, b);
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use covalent_testkit::fixtures::{link, new_account, new_agent_node, wait_synced};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let (alice, _secret) = new_account("alice")?;
//!     let server = new_agent_node();
//!     let link = link(&alice, "alice", &server, "server");
//!
//!     let group = alice.create_group()?;
//!     wait_synced(&[&alice, &server], &group).await?;
//!     link.cut();
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{eventually, link, new_account, new_agent_node, wait_synced, Link};
pub use generators::{edit_script, map_transactions, EditOp};
