//! CoPlainText: a list of extended grapheme clusters.
//!
//! Positions that must survive concurrent edits (cursors, selections) are
//! expressed as the [`OpId`] of a grapheme, not as an index.

use serde_json::Value;
use std::fmt;
use std::ops::Range;
use unicode_segmentation::UnicodeSegmentation;

use super::list::{CoList, ListAnchor, ListChange};
use super::{ContentMerge, DecodedTransaction};
use crate::ids::OpId;

#[derive(Debug, Clone, Default)]
pub struct CoPlainText {
    list: CoList,
}

impl CoPlainText {
    /// Visible graphemes with their identities.
    pub fn graphemes(&self) -> Vec<(OpId, String)> {
        self.list
            .entries()
            .into_iter()
            .filter_map(|e| Some((e.op, e.value.as_str()?.to_string())))
            .collect()
    }

    /// Number of visible graphemes.
    pub fn len(&self) -> usize {
        self.graphemes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Changes inserting `text` right after `anchor`.
    pub fn insert_changes(anchor: ListAnchor, text: &str) -> Vec<Value> {
        ListChange::insert_all(anchor, text.graphemes(true).map(|g| Value::String(g.to_string())))
    }

    /// Anchor that inserts at grapheme index `index`.
    pub fn anchor_for_index(&self, index: usize) -> ListAnchor {
        if index == 0 {
            return ListAnchor::Start;
        }
        let graphemes = self.graphemes();
        match graphemes.get(index - 1).or(graphemes.last()) {
            Some((op, _)) => ListAnchor::After(*op),
            None => ListAnchor::Start,
        }
    }

    /// Changes deleting the graphemes in `range` (grapheme indices).
    pub fn delete_changes(&self, range: Range<usize>) -> Vec<Value> {
        self.graphemes()
            .into_iter()
            .skip(range.start)
            .take(range.end.saturating_sub(range.start))
            .map(|(op, _)| ListChange::delete(op))
            .collect()
    }

    /// Stable cursor for the grapheme at `index`.
    pub fn cursor_at(&self, index: usize) -> Option<OpId> {
        self.graphemes().get(index).map(|(op, _)| *op)
    }

    /// Current index of a cursor, `None` if its grapheme is gone.
    pub fn index_of(&self, cursor: &OpId) -> Option<usize> {
        self.graphemes().iter().position(|(op, _)| op == cursor)
    }
}

impl fmt::Display for CoPlainText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (_, g) in self.graphemes() {
            f.write_str(&g)?;
        }
        Ok(())
    }
}

impl ContentMerge for CoPlainText {
    fn apply(&mut self, tx: &DecodedTransaction) {
        self.list.apply(tx);
    }

    fn to_json(&self) -> Value {
        Value::String(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::decoded;
    use super::*;

    #[test]
    fn test_insert_splits_graphemes() {
        let mut text = CoPlainText::default();
        text.apply(&decoded(1, 0, 1, CoPlainText::insert_changes(ListAnchor::Start, "he\u{301}y👍🏽")));
        assert_eq!(text.to_string(), "he\u{301}y👍🏽");
        assert_eq!(text.len(), 4);
    }

    #[test]
    fn test_insert_in_middle_and_delete_range() {
        let mut text = CoPlainText::default();
        text.apply(&decoded(1, 0, 1, CoPlainText::insert_changes(ListAnchor::Start, "hello")));
        let anchor = text.anchor_for_index(2);
        text.apply(&decoded(1, 1, 2, CoPlainText::insert_changes(anchor, "XY")));
        assert_eq!(text.to_string(), "heXYllo");

        let deletes = text.delete_changes(0..2);
        text.apply(&decoded(1, 2, 3, deletes));
        assert_eq!(text.to_string(), "XYllo");
    }

    #[test]
    fn test_cursor_survives_concurrent_insert() {
        let mut text = CoPlainText::default();
        text.apply(&decoded(1, 0, 1, CoPlainText::insert_changes(ListAnchor::Start, "abc")));
        let cursor = text.cursor_at(2).unwrap();
        assert_eq!(text.index_of(&cursor), Some(2));

        text.apply(&decoded(2, 0, 5, CoPlainText::insert_changes(ListAnchor::Start, "__")));
        assert_eq!(text.to_string(), "__abc");
        assert_eq!(text.index_of(&cursor), Some(4));
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let base = decoded(1, 0, 1, CoPlainText::insert_changes(ListAnchor::Start, "ac"));
        let mut seed = CoPlainText::default();
        seed.apply(&base);
        let anchor = seed.anchor_for_index(1);

        let left = decoded(1, 1, 5, CoPlainText::insert_changes(anchor, "b"));
        let right = decoded(2, 0, 6, CoPlainText::insert_changes(anchor, "B"));

        let mut one = CoPlainText::default();
        for tx in [&base, &left, &right] {
            one.apply(tx);
        }
        let mut two = CoPlainText::default();
        for tx in [&right, &left, &base] {
            two.apply(tx);
        }
        assert_eq!(one.to_string(), two.to_string());
        assert_eq!(one.to_string(), "aBbc");
    }
}
