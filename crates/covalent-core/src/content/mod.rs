//! Content merge engine.
//!
//! Every CoValue kind turns the valid, decoded transactions of all sessions
//! into materialized content. The kind is chosen once from the header, so the
//! kinds form a closed enum ([`CoContent`]) whose variants share the
//! [`ContentMerge`] capability.
//!
//! Applying the same set of transactions in any order yields the same
//! content for every kind.

mod list;
mod map;
mod stream;
mod text;

pub use list::{CoList, ListAnchor, ListChange, ListEntry};
pub use map::{CoMap, MapChange, MapEdit};
pub use stream::{CoStream, StreamItem};
pub use text::CoPlainText;

use serde_json::Value;
use std::collections::BTreeSet;

use crate::header::CoValueType;
use crate::ids::{AccountOrAgent, CoId, TransactionId};

/// A valid transaction whose changes are available in the clear.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTransaction {
    pub id: TransactionId,
    pub made_at: i64,
    pub changes: Vec<Value>,
}

impl DecodedTransaction {
    pub fn author(&self) -> AccountOrAgent {
        self.id.session.author
    }
}

/// Folding decoded transactions into materialized content.
pub trait ContentMerge {
    /// Incorporate one transaction. Order of calls does not affect the result.
    fn apply(&mut self, tx: &DecodedTransaction);

    /// Materialized content as JSON.
    fn to_json(&self) -> Value;
}

/// Materialized content of a CoValue, one variant per kind.
#[derive(Debug, Clone)]
pub enum CoContent {
    Map(CoMap),
    List(CoList),
    Stream(CoStream),
    Text(CoPlainText),
}

impl CoContent {
    /// Empty content for a kind.
    pub fn empty(kind: CoValueType) -> Self {
        match kind {
            CoValueType::Comap => CoContent::Map(CoMap::default()),
            CoValueType::Colist => CoContent::List(CoList::default()),
            CoValueType::Costream => CoContent::Stream(CoStream::default()),
            CoValueType::Coplaintext => CoContent::Text(CoPlainText::default()),
        }
    }

    /// Build content from transactions.
    pub fn from_transactions<'a>(
        kind: CoValueType,
        txs: impl IntoIterator<Item = &'a DecodedTransaction>,
    ) -> Self {
        let mut content = Self::empty(kind);
        for tx in txs {
            content.apply(tx);
        }
        content
    }

    pub fn as_map(&self) -> Option<&CoMap> {
        match self {
            CoContent::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&CoList> {
        match self {
            CoContent::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&CoStream> {
        match self {
            CoContent::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&CoPlainText> {
        match self {
            CoContent::Text(text) => Some(text),
            _ => None,
        }
    }

    /// CoValue ids mentioned anywhere in the materialized values.
    pub fn referenced_ids(&self) -> BTreeSet<CoId> {
        let mut out = BTreeSet::new();
        collect_ids(&self.to_json(), &mut out);
        out
    }
}

impl ContentMerge for CoContent {
    fn apply(&mut self, tx: &DecodedTransaction) {
        match self {
            CoContent::Map(map) => map.apply(tx),
            CoContent::List(list) => list.apply(tx),
            CoContent::Stream(stream) => stream.apply(tx),
            CoContent::Text(text) => text.apply(tx),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            CoContent::Map(map) => map.to_json(),
            CoContent::List(list) => list.to_json(),
            CoContent::Stream(stream) => stream.to_json(),
            CoContent::Text(text) => text.to_json(),
        }
    }
}

fn collect_ids(value: &Value, out: &mut BTreeSet<CoId>) {
    match value {
        Value::String(s) => {
            if let Ok(id) = s.parse::<CoId>() {
                out.insert(id);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_ids(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_ids(v, out)),
        _ => {}
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::ids::SessionId;

    pub fn session(byte: u8) -> SessionId {
        SessionId {
            author: AccountOrAgent::Account(CoId([byte; 32])),
            suffix: [byte; 8],
        }
    }

    pub fn decoded(byte: u8, tx_index: u32, made_at: i64, changes: Vec<Value>) -> DecodedTransaction {
        DecodedTransaction {
            id: TransactionId {
                session: session(byte),
                tx_index,
            },
            made_at,
            changes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::decoded;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_selects_variant() {
        assert!(CoContent::empty(CoValueType::Comap).as_map().is_some());
        assert!(CoContent::empty(CoValueType::Colist).as_list().is_some());
        assert!(CoContent::empty(CoValueType::Costream).as_stream().is_some());
        assert!(CoContent::empty(CoValueType::Coplaintext).as_text().is_some());
    }

    #[test]
    fn test_referenced_ids() {
        let target = CoId([5; 32]);
        let tx = decoded(
            1,
            0,
            1,
            vec![
                MapChange::set("child", json!(target.to_string())),
                MapChange::set("name", json!("co_znot-an-id")),
            ],
        );
        let content = CoContent::from_transactions(CoValueType::Comap, [&tx]);
        let ids = content.referenced_ids();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&target));
    }
}
