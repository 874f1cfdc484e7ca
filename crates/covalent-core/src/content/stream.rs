//! CoStream: append-only feeds, one per session.

use serde_json::Value;
use std::collections::BTreeMap;

use super::{ContentMerge, DecodedTransaction};
use crate::ids::{AccountOrAgent, SessionId, TransactionId};

#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub value: Value,
    pub by: AccountOrAgent,
    pub at: i64,
    pub tx: TransactionId,
    pub change_idx: u32,
}

impl StreamItem {
    fn order_key(&self) -> (i64, TransactionId, u32) {
        (self.at, self.tx, self.change_idx)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoStream {
    per_session: BTreeMap<SessionId, Vec<StreamItem>>,
}

impl CoStream {
    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.per_session.keys()
    }

    /// Distinct authors that have pushed items.
    pub fn authors(&self) -> Vec<AccountOrAgent> {
        let mut authors: Vec<AccountOrAgent> = self.per_session.keys().map(|s| s.author).collect();
        authors.dedup();
        authors
    }

    /// Items of one session, in session order.
    pub fn items_in(&self, session: &SessionId) -> &[StreamItem] {
        self.per_session.get(session).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Items of all sessions of `author`, in time order.
    pub fn items_by(&self, author: &AccountOrAgent) -> Vec<&StreamItem> {
        let mut items: Vec<&StreamItem> = self
            .per_session
            .iter()
            .filter(|(session, _)| session.author == *author)
            .flat_map(|(_, items)| items.iter())
            .collect();
        items.sort_by_key(|item| item.order_key());
        items
    }

    pub fn last_item_in(&self, session: &SessionId) -> Option<&StreamItem> {
        self.items_in(session).last()
    }

    pub fn last_item_by(&self, author: &AccountOrAgent) -> Option<&StreamItem> {
        self.items_by(author).pop()
    }

    /// Most recent item across every session.
    pub fn last_item(&self) -> Option<&StreamItem> {
        self.per_session
            .values()
            .filter_map(|items| items.last())
            .max_by_key(|item| item.order_key())
    }

    pub fn len(&self) -> usize {
        self.per_session.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentMerge for CoStream {
    fn apply(&mut self, tx: &DecodedTransaction) {
        let items = self.per_session.entry(tx.id.session).or_default();
        for (idx, value) in tx.changes.iter().enumerate() {
            let item = StreamItem {
                value: value.clone(),
                by: tx.author(),
                at: tx.made_at,
                tx: tx.id,
                change_idx: idx as u32,
            };
            let pos = items.partition_point(|i| (i.tx.tx_index, i.change_idx) < (tx.id.tx_index, item.change_idx));
            if items
                .get(pos)
                .is_some_and(|i| (i.tx.tx_index, i.change_idx) == (tx.id.tx_index, item.change_idx))
            {
                continue;
            }
            items.insert(pos, item);
        }
    }

    fn to_json(&self) -> Value {
        Value::Object(
            self.per_session
                .iter()
                .map(|(session, items)| {
                    (
                        session.to_string(),
                        Value::Array(items.iter().map(|i| i.value.clone()).collect()),
                    )
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{decoded, session};
    use super::*;
    use crate::ids::CoId;
    use serde_json::json;

    #[test]
    fn test_per_session_and_per_account_views() {
        let mut stream = CoStream::default();
        stream.apply(&decoded(1, 0, 10, vec![json!("a1")]));
        stream.apply(&decoded(2, 0, 11, vec![json!("b1")]));
        stream.apply(&decoded(1, 1, 12, vec![json!("a2")]));

        assert_eq!(stream.len(), 3);
        assert_eq!(stream.items_in(&session(1)).len(), 2);
        assert_eq!(stream.last_item_in(&session(1)).unwrap().value, json!("a2"));

        let author = AccountOrAgent::Account(CoId([2; 32]));
        let last = stream.last_item_by(&author).unwrap();
        assert_eq!(last.value, json!("b1"));
        assert_eq!(last.at, 11);
        assert_eq!(last.by, author);

        assert_eq!(stream.last_item().unwrap().value, json!("a2"));
    }

    #[test]
    fn test_out_of_order_apply_keeps_session_order() {
        let mut stream = CoStream::default();
        stream.apply(&decoded(1, 1, 12, vec![json!("second")]));
        stream.apply(&decoded(1, 0, 10, vec![json!("first")]));
        stream.apply(&decoded(1, 0, 10, vec![json!("first")]));

        let values: Vec<_> = stream.items_in(&session(1)).iter().map(|i| i.value.clone()).collect();
        assert_eq!(values, vec![json!("first"), json!("second")]);
    }

    #[test]
    fn test_json_is_keyed_by_session() {
        let mut stream = CoStream::default();
        stream.apply(&decoded(1, 0, 1, vec![json!(1), json!(2)]));
        let json = stream.to_json();
        assert_eq!(json[session(1).to_string()], json!([1, 2]));
    }
}
