//! CoList: a replicated growable array.
//!
//! Every element is identified by the [`OpId`] of the change that inserted
//! it and points at its predecessor (another element or the start). The
//! visible sequence is a pre-order walk of that predecessor tree, with
//! siblings ordered newest first by `(madeAt, sessionID, txIndex, changeIdx)`.
//! Deleted elements stay in the tree as tombstones.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::{ContentMerge, DecodedTransaction};
use crate::ids::{AccountOrAgent, OpId};

/// Where an insertion goes: at the start or right after an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListAnchor {
    Start,
    After(OpId),
}

impl Serialize for ListAnchor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ListAnchor::Start => serializer.serialize_str("start"),
            ListAnchor::After(op) => op.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ListAnchor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Keyword(String),
            Op(OpId),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Keyword(k) if k == "start" => Ok(ListAnchor::Start),
            Repr::Keyword(k) => Err(serde::de::Error::custom(format!("unknown anchor {k:?}"))),
            Repr::Op(op) => Ok(ListAnchor::After(op)),
        }
    }
}

/// A list operation as it appears in a transaction's change list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ListChange {
    #[serde(rename = "app")]
    App { value: Value, after: ListAnchor },
    #[serde(rename = "del")]
    Del { insertion: OpId },
}

impl ListChange {
    /// Changes inserting `values`, in order, right after `anchor`.
    ///
    /// All values hang off the same anchor in reverse order; since later
    /// changes of one transaction sort first among siblings, they materialize
    /// in the given order.
    pub fn insert_all(anchor: ListAnchor, values: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut values: Vec<Value> = values.into_iter().collect();
        values.reverse();
        values
            .into_iter()
            .map(|value| serde_json::json!({ "op": "app", "value": value, "after": anchor }))
            .collect()
    }

    pub fn delete(insertion: OpId) -> Value {
        serde_json::json!({ "op": "del", "insertion": insertion })
    }
}

#[derive(Debug, Clone)]
struct Insertion {
    value: Value,
    at: i64,
    by: AccountOrAgent,
}

/// A visible list element.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub op: OpId,
    pub value: Value,
    pub at: i64,
    pub by: AccountOrAgent,
}

#[derive(Debug, Clone, Default)]
pub struct CoList {
    insertions: HashMap<OpId, Insertion>,
    children: HashMap<ListAnchor, Vec<(i64, OpId)>>,
    deleted: HashSet<OpId>,
}

impl CoList {
    /// Visible elements in list order.
    pub fn entries(&self) -> Vec<ListEntry> {
        let mut out = Vec::new();
        let mut stack: Vec<OpId> = Vec::new();
        push_children(&mut stack, self.children.get(&ListAnchor::Start));

        while let Some(op) = stack.pop() {
            if let Some(ins) = self.insertions.get(&op) {
                if !self.deleted.contains(&op) {
                    out.push(ListEntry {
                        op,
                        value: ins.value.clone(),
                        at: ins.at,
                        by: ins.by,
                    });
                }
            }
            push_children(&mut stack, self.children.get(&ListAnchor::After(op)));
        }
        out
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries().into_iter().map(|e| e.value).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.entries().into_iter().nth(index).map(|e| e.value)
    }

    /// Anchor that inserts a new element at `index`.
    pub fn anchor_for_index(&self, index: usize) -> ListAnchor {
        if index == 0 {
            return ListAnchor::Start;
        }
        match self.entries().get(index - 1) {
            Some(entry) => ListAnchor::After(entry.op),
            None => self.end_anchor(),
        }
    }

    /// Anchor that appends after the last visible element.
    pub fn end_anchor(&self) -> ListAnchor {
        self.entries()
            .last()
            .map(|e| ListAnchor::After(e.op))
            .unwrap_or(ListAnchor::Start)
    }

    /// Identity of the element at `index`.
    pub fn op_at(&self, index: usize) -> Option<OpId> {
        self.entries().get(index).map(|e| e.op)
    }

    /// Visible position of an element, `None` if unknown or deleted.
    pub fn index_of(&self, op: &OpId) -> Option<usize> {
        self.entries().iter().position(|e| e.op == *op)
    }

    pub fn is_deleted(&self, op: &OpId) -> bool {
        self.deleted.contains(op)
    }
}

// Children are kept sorted ascending; pushing in that order pops newest first.
fn push_children(stack: &mut Vec<OpId>, children: Option<&Vec<(i64, OpId)>>) {
    if let Some(children) = children {
        stack.extend(children.iter().map(|(_, op)| *op));
    }
}

impl ContentMerge for CoList {
    fn apply(&mut self, tx: &DecodedTransaction) {
        for (idx, change) in tx.changes.iter().enumerate() {
            let op = OpId::new(tx.id, idx as u32);
            match serde_json::from_value::<ListChange>(change.clone()) {
                Ok(ListChange::App { value, after }) => {
                    if self.insertions.contains_key(&op) {
                        continue;
                    }
                    self.insertions.insert(
                        op,
                        Insertion {
                            value,
                            at: tx.made_at,
                            by: tx.author(),
                        },
                    );
                    let siblings = self.children.entry(after).or_default();
                    let key = (tx.made_at, op);
                    let pos = siblings.partition_point(|s| *s < key);
                    siblings.insert(pos, key);
                }
                Ok(ListChange::Del { insertion }) => {
                    self.deleted.insert(insertion);
                }
                Err(e) => {
                    tracing::debug!(tx = %tx.id, error = %e, "skipping malformed list change");
                }
            }
        }
    }

    fn to_json(&self) -> Value {
        Value::Array(self.values())
    }
}
