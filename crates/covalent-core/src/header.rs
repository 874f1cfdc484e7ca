//! CoValue headers: the immutable, content-addressed part of every CoValue.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::canonical::canonical_bytes;
use crate::crypto::Hash;
use crate::error::Result;
use crate::ids::{AccountOrAgent, CoId};

/// Content kind of a CoValue, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoValueType {
    Comap,
    Colist,
    Costream,
    Coplaintext,
}

/// How transactions of a CoValue are authorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Ruleset {
    /// Every correctly signed transaction is valid.
    #[serde(rename = "unsafeAllowAll")]
    UnsafeAllowAll,

    /// The CoValue is itself a group; its own history decides who may change it.
    #[serde(rename = "group")]
    Group {
        #[serde(rename = "initialAdmin")]
        initial_admin: AccountOrAgent,
    },

    /// Writers and readers are decided by the referenced group.
    #[serde(rename = "ownedByGroup")]
    OwnedByGroup { group: CoId },
}

/// The immutable header of a CoValue. Its canonical hash is the CoValue's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub kind: CoValueType,
    pub ruleset: Ruleset,
    pub meta: Option<serde_json::Value>,
    #[serde(rename = "createdAt")]
    pub created_at: Option<i64>,
    pub uniqueness: Option<String>,
}

impl CoValueHeader {
    /// A new header with a random uniqueness nonce.
    pub fn new(kind: CoValueType, ruleset: Ruleset, meta: Option<serde_json::Value>, now: i64) -> Self {
        Self {
            kind,
            ruleset,
            meta,
            created_at: Some(now),
            uniqueness: Some(random_uniqueness()),
        }
    }

    /// Header of a group whose first admin is `initial_admin`.
    pub fn group(initial_admin: AccountOrAgent, now: i64) -> Self {
        Self::new(
            CoValueType::Comap,
            Ruleset::Group { initial_admin },
            Some(serde_json::json!({ "type": "group" })),
            now,
        )
    }

    /// Header of an account: a group seeded with its first agent.
    pub fn account(initial_agent: AccountOrAgent, now: i64) -> Self {
        Self::new(
            CoValueType::Comap,
            Ruleset::Group {
                initial_admin: initial_agent,
            },
            Some(serde_json::json!({ "type": "account" })),
            now,
        )
    }

    /// Header of a CoValue owned by `group`.
    pub fn owned_by(kind: CoValueType, group: CoId, meta: Option<serde_json::Value>, now: i64) -> Self {
        Self::new(kind, Ruleset::OwnedByGroup { group }, meta, now)
    }

    /// Compute the content-derived id.
    pub fn id(&self) -> Result<CoId> {
        let bytes = canonical_bytes(self)?;
        Ok(CoId(Hash::of(&bytes).0))
    }

    pub fn is_group(&self) -> bool {
        matches!(self.ruleset, Ruleset::Group { .. })
    }

    pub fn is_account(&self) -> bool {
        self.is_group() && self.meta_type() == Some("account")
    }

    /// The group this CoValue is owned by, if any.
    pub fn owner_group(&self) -> Option<&CoId> {
        match &self.ruleset {
            Ruleset::OwnedByGroup { group } => Some(group),
            _ => None,
        }
    }

    fn meta_type(&self) -> Option<&str> {
        self.meta.as_ref()?.get("type")?.as_str()
    }
}

fn random_uniqueness() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("z{}", hex::encode(bytes))
}
