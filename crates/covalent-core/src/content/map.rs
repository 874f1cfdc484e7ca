//! CoMap: last-write-wins map with full per-key history.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{ContentMerge, DecodedTransaction};
use crate::ids::{AccountOrAgent, TransactionId};

/// A map operation as it appears in a transaction's change list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum MapChange {
    Set { key: String, value: Value },
    Del { key: String },
}

impl MapChange {
    pub fn set(key: impl Into<String>, value: Value) -> Value {
        serde_json::json!({ "op": "set", "key": key.into(), "value": value })
    }

    pub fn del(key: impl Into<String>) -> Value {
        serde_json::json!({ "op": "del", "key": key.into() })
    }
}

/// One write to a key. `value` is `None` for deletions.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEdit {
    pub tx: TransactionId,
    pub change_idx: u32,
    pub by: AccountOrAgent,
    pub at: i64,
    pub value: Option<Value>,
}

impl MapEdit {
    fn order_key(&self) -> (i64, TransactionId, u32) {
        (self.at, self.tx, self.change_idx)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoMap {
    edits: BTreeMap<String, Vec<MapEdit>>,
}

impl CoMap {
    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.last_edit(key)?.value.as_ref()
    }

    /// Value of `key` considering only edits made at or before `at`.
    pub fn get_at(&self, key: &str, at: i64) -> Option<&Value> {
        self.edits
            .get(key)?
            .iter()
            .rev()
            .find(|edit| edit.at <= at)?
            .value
            .as_ref()
    }

    /// The whole map as it was at time `at`.
    pub fn state_at(&self, at: i64) -> BTreeMap<String, Value> {
        self.edits
            .keys()
            .filter_map(|key| Some((key.clone(), self.get_at(key, at)?.clone())))
            .collect()
    }

    /// Most recent edit of `key`, including deletions.
    pub fn last_edit(&self, key: &str) -> Option<&MapEdit> {
        self.edits.get(key)?.last()
    }

    /// Every edit of `key` in merge order.
    pub fn history(&self, key: &str) -> &[MapEdit] {
        self.edits.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Keys that currently hold a value.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.edits
            .iter()
            .filter(|(_, edits)| edits.last().is_some_and(|e| e.value.is_some()))
            .map(|(key, _)| key.as_str())
    }

    /// Current entries as owned pairs.
    pub fn entries(&self) -> BTreeMap<String, Value> {
        self.edits
            .iter()
            .filter_map(|(key, edits)| Some((key.clone(), edits.last()?.value.clone()?)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keys().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&mut self, key: String, edit: MapEdit) {
        let edits = self.edits.entry(key).or_default();
        let pos = edits.partition_point(|e| e.order_key() < edit.order_key());
        if edits.get(pos).map(|e| e.order_key()) != Some(edit.order_key()) {
            edits.insert(pos, edit);
        }
    }
}

impl ContentMerge for CoMap {
    fn apply(&mut self, tx: &DecodedTransaction) {
        for (idx, change) in tx.changes.iter().enumerate() {
            let (key, value) = match serde_json::from_value::<MapChange>(change.clone()) {
                Ok(MapChange::Set { key, value }) => (key, Some(value)),
                Ok(MapChange::Del { key }) => (key, None),
                Err(e) => {
                    tracing::debug!(tx = %tx.id, error = %e, "skipping malformed map change");
                    continue;
                }
            };
            self.record(
                key,
                MapEdit {
                    tx: tx.id,
                    change_idx: idx as u32,
                    by: tx.author(),
                    at: tx.made_at,
                    value,
                },
            );
        }
    }

    fn to_json(&self) -> Value {
        Value::Object(self.entries().into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::decoded;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_last_write_wins_with_state_at() {
        let a = decoded(1, 0, 10, vec![MapChange::set("key", json!("A"))]);
        let b = decoded(2, 0, 12, vec![MapChange::set("key", json!("B"))]);

        for order in [[&a, &b], [&b, &a]] {
            let mut map = CoMap::default();
            for tx in order {
                map.apply(tx);
            }
            assert_eq!(map.get("key"), Some(&json!("B")));
            assert_eq!(map.get_at("key", 11), Some(&json!("A")));
            assert_eq!(map.get_at("key", 9), None);
        }
    }

    #[test]
    fn test_delete_and_history() {
        let mut map = CoMap::default();
        map.apply(&decoded(1, 0, 1, vec![MapChange::set("a", json!(1))]));
        map.apply(&decoded(1, 1, 2, vec![MapChange::del("a")]));

        assert_eq!(map.get("a"), None);
        assert!(map.is_empty());
        assert_eq!(map.history("a").len(), 2);
        assert_eq!(map.last_edit("a").unwrap().at, 2);
        assert_eq!(map.get_at("a", 1), Some(&json!(1)));
    }

    #[test]
    fn test_later_change_in_same_transaction_wins() {
        let mut map = CoMap::default();
        map.apply(&decoded(
            1,
            0,
            5,
            vec![MapChange::set("x", json!(1)), MapChange::set("x", json!(2))],
        ));
        assert_eq!(map.get("x"), Some(&json!(2)));
    }

    #[test]
    fn test_same_time_tie_breaks_on_session() {
        let low = decoded(1, 0, 7, vec![MapChange::set("x", json!("low"))]);
        let high = decoded(2, 0, 7, vec![MapChange::set("x", json!("high"))]);
        let mut map = CoMap::default();
        map.apply(&high);
        map.apply(&low);
        assert_eq!(map.get("x"), Some(&json!("high")));
    }

    #[test]
    fn test_reapplying_is_idempotent() {
        let tx = decoded(1, 0, 1, vec![MapChange::set("a", json!(1))]);
        let mut map = CoMap::default();
        map.apply(&tx);
        map.apply(&tx);
        assert_eq!(map.history("a").len(), 1);
    }

    #[test]
    fn test_malformed_changes_are_skipped() {
        let mut map = CoMap::default();
        map.apply(&decoded(1, 0, 1, vec![json!({"op": "bogus"}), MapChange::set("a", json!(true))]));
        assert_eq!(map.to_json(), json!({"a": true}));
        assert_eq!(map.state_at(1).len(), 1);
    }
}
