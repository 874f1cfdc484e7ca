//! Proptest generators for property-based testing.
//!
//! Two families: raw decoded transactions for exercising the merge engine
//! directly, and edit operations replayed against a [`LocalNode`].

use proptest::prelude::*;
use serde_json::{json, Value};

use covalent::{CoId, LocalNode};
use covalent_core::{
    AccountOrAgent, CoValueType, DecodedTransaction, MapChange, SessionId, TransactionId,
};

/// Keys drawn from a small pool so that sessions collide.
pub fn map_key() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(String::from)
}

/// A small JSON scalar.
pub fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z]{0,6}".prop_map(|s| json!(s)),
        any::<bool>().prop_map(|b| json!(b)),
        Just(Value::Null),
    ]
}

/// A session authored by a synthetic account.
pub fn session(byte: u8) -> SessionId {
    SessionId {
        author: AccountOrAgent::Account(CoId([byte; 32])),
        suffix: [byte; 8],
    }
}

/// One map change: a set or a delete.
pub fn map_change() -> impl Strategy<Value = Value> {
    prop_oneof![
        3 => (map_key(), scalar()).prop_map(|(key, value)| MapChange::set(key, value)),
        1 => map_key().prop_map(MapChange::del),
    ]
}

/// Map transactions spread over up to four sessions.
///
/// `madeAt` values come from a narrow range so that ties happen and the
/// session tie-break gets exercised.
pub fn map_transactions() -> impl Strategy<Value = Vec<DecodedTransaction>> {
    prop::collection::vec(
        (
            1u8..=4,
            0i64..20,
            prop::collection::vec(map_change(), 1..4),
        ),
        0..24,
    )
    .prop_map(|entries| {
        let mut next_index = [0u32; 5];
        entries
            .into_iter()
            .map(|(byte, made_at, changes)| {
                let tx_index = next_index[byte as usize];
                next_index[byte as usize] += 1;
                DecodedTransaction {
                    id: TransactionId {
                        session: session(byte),
                        tx_index,
                    },
                    made_at,
                    changes,
                }
            })
            .collect()
    })
}

/// Stream items from several sessions; one change per transaction.
pub fn stream_transactions() -> impl Strategy<Value = Vec<DecodedTransaction>> {
    map_transactions().prop_map(|txs| {
        txs.into_iter()
            .map(|mut tx| {
                tx.changes.truncate(1);
                tx
            })
            .collect()
    })
}

/// An edit replayed against a node. Positions are clamped to the current
/// length when applied.
#[derive(Debug, Clone)]
pub enum EditOp {
    MapSet { key: String, value: Value },
    MapDelete { key: String },
    ListInsert { index: usize, value: Value },
    ListDelete { index: usize },
    TextInsert { index: usize, text: String },
    TextDelete { start: usize, len: usize },
    StreamPush { value: Value },
}

impl EditOp {
    /// Apply this edit to `id` on `node`.
    ///
    /// Deletes on empty content are skipped.
    pub fn apply(&self, node: &LocalNode, id: &CoId) -> covalent::Result<()> {
        match self {
            EditOp::MapSet { key, value } => node.map_set(id, key, value.clone()),
            EditOp::MapDelete { key } => node.map_delete(id, key),
            EditOp::ListInsert { index, value } => {
                let len = node.list(id)?.len();
                node.list_insert(id, (*index).min(len), value.clone())
            }
            EditOp::ListDelete { index } => {
                let len = node.list(id)?.len();
                if len == 0 {
                    return Ok(());
                }
                node.list_delete(id, index % len)
            }
            EditOp::TextInsert { index, text } => {
                let len = node.text(id)?.len();
                node.text_insert(id, (*index).min(len), text)
            }
            EditOp::TextDelete { start, len } => {
                let current = node.text(id)?.len();
                if current == 0 {
                    return Ok(());
                }
                let start = start % current;
                let end = (start + len).min(current);
                node.text_delete(id, start..end)
            }
            EditOp::StreamPush { value } => node.stream_push(id, value.clone()),
        }
    }
}

/// Edits that fit a CoValue of `kind`.
pub fn edit_op(kind: CoValueType) -> BoxedStrategy<EditOp> {
    match kind {
        CoValueType::Comap => prop_oneof![
            3 => (map_key(), scalar()).prop_map(|(key, value)| EditOp::MapSet { key, value }),
            1 => map_key().prop_map(|key| EditOp::MapDelete { key }),
        ]
        .boxed(),
        CoValueType::Colist => prop_oneof![
            3 => (0usize..8, scalar()).prop_map(|(index, value)| EditOp::ListInsert { index, value }),
            1 => (0usize..8).prop_map(|index| EditOp::ListDelete { index }),
        ]
        .boxed(),
        CoValueType::Coplaintext => prop_oneof![
            3 => (0usize..16, "[a-z é👍]{1,4}")
                .prop_map(|(index, text)| EditOp::TextInsert { index, text }),
            1 => (0usize..16, 1usize..4).prop_map(|(start, len)| EditOp::TextDelete { start, len }),
        ]
        .boxed(),
        CoValueType::Costream => scalar().prop_map(|value| EditOp::StreamPush { value }).boxed(),
    }
}

/// A script of up to `max` edits for a CoValue of `kind`.
pub fn edit_script(kind: CoValueType, max: usize) -> impl Strategy<Value = Vec<EditOp>> {
    prop::collection::vec(edit_op(kind), 0..=max)
}

/// Any content kind.
pub fn content_kind() -> impl Strategy<Value = CoValueType> {
    prop_oneof![
        Just(CoValueType::Comap),
        Just(CoValueType::Colist),
        Just(CoValueType::Costream),
        Just(CoValueType::Coplaintext),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_core::{CoContent, ContentMerge};

    fn merged(kind: CoValueType, txs: &[DecodedTransaction]) -> Value {
        CoContent::from_transactions(kind, txs).to_json()
    }

    proptest! {
        #[test]
        fn test_map_merge_ignores_arrival_order(txs in map_transactions(), seed in any::<u64>()) {
            let mut shuffled = txs.clone();
            let len = shuffled.len().max(1);
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();
            prop_assert_eq!(
                merged(CoValueType::Comap, &txs),
                merged(CoValueType::Comap, &shuffled)
            );
        }

        #[test]
        fn test_stream_merge_ignores_arrival_order(txs in stream_transactions()) {
            let mut reversed = txs.clone();
            reversed.reverse();
            prop_assert_eq!(
                merged(CoValueType::Costream, &txs),
                merged(CoValueType::Costream, &reversed)
            );
        }

        #[test]
        fn test_map_merge_is_idempotent(txs in map_transactions()) {
            let doubled: Vec<_> = txs.iter().chain(txs.iter()).cloned().collect();
            prop_assert_eq!(
                merged(CoValueType::Comap, &txs),
                merged(CoValueType::Comap, &doubled)
            );
        }
    }
}
