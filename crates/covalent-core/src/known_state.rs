//! Known state: what a replica holds of a CoValue, without any payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{CoId, SessionId};

/// Header flag plus the number of transactions held per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: CoId,
    pub header: bool,
    pub sessions: BTreeMap<SessionId, u32>,
}

impl KnownState {
    /// Nothing known about `id`.
    pub fn empty(id: CoId) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    /// Number of transactions known for `session`.
    pub fn count(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Merge another view into this one, taking the maximum per session.
    pub fn combine_with(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (session, &count) in &other.sessions {
            let entry = self.sessions.entry(*session).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    /// Record that `count` transactions of `session` are known.
    pub fn update_session(&mut self, session: SessionId, count: u32) {
        let entry = self.sessions.entry(session).or_insert(0);
        if count > *entry {
            *entry = count;
        }
    }

    /// Whether `self` holds anything `other` does not.
    pub fn is_ahead_of(&self, other: &KnownState) -> bool {
        (self.header && !other.header)
            || self
                .sessions
                .iter()
                .any(|(session, &count)| count > other.count(session))
    }

    /// Whether `other` holds everything `self` holds.
    pub fn is_covered_by(&self, other: &KnownState) -> bool {
        !self.is_ahead_of(other)
    }

    pub fn total_transactions(&self) -> u64 {
        self.sessions.values().map(|&c| c as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AccountOrAgent;

    fn session(byte: u8) -> SessionId {
        SessionId {
            author: AccountOrAgent::Account(CoId([byte; 32])),
            suffix: [byte; 8],
        }
    }

    #[test]
    fn test_combine_takes_maximum() {
        let id = CoId([0; 32]);
        let mut a = KnownState::empty(id);
        a.update_session(session(1), 3);
        let mut b = KnownState::empty(id);
        b.header = true;
        b.update_session(session(1), 2);
        b.update_session(session(2), 5);

        a.combine_with(&b);
        assert!(a.header);
        assert_eq!(a.count(&session(1)), 3);
        assert_eq!(a.count(&session(2)), 5);
    }

    #[test]
    fn test_is_ahead_of() {
        let id = CoId([0; 32]);
        let mut ours = KnownState::empty(id);
        ours.header = true;
        ours.update_session(session(1), 2);
        let mut theirs = ours.clone();

        assert!(!ours.is_ahead_of(&theirs));
        assert!(ours.is_covered_by(&theirs));

        ours.update_session(session(1), 3);
        assert!(ours.is_ahead_of(&theirs));

        theirs.update_session(session(2), 1);
        assert!(ours.is_ahead_of(&theirs));
        assert!(theirs.is_ahead_of(&ours));
    }

    #[test]
    fn test_json_field_names() {
        let mut state = KnownState::empty(CoId([4; 32]));
        state.update_session(session(1), 7);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["header"], false);
        assert_eq!(json["sessions"][session(1).to_string()], 7);
    }
}
