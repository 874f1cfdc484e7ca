//! Per-peer protocol state.
//!
//! For every CoValue a peer has been involved with we track what we believe
//! it holds. The optimistic view is advanced as soon as we send content, so
//! the same transactions are not sent twice; the confirmed view is what the
//! peer itself last told us. A correction from the peer replaces both.

use std::collections::HashMap;
use std::sync::Arc;

use covalent_core::{CoId, KnownState};

use crate::error::{Result, SyncError};
use crate::messages::{ContentMessage, SyncMessage};
use crate::queue::{Dispatch, PriorityBasedMessageQueue};
use crate::transport::{PeerId, PeerRole};

/// Sync phase of one CoValue with one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Nothing exchanged yet.
    Unknown,
    /// A `load` or `known` was exchanged; content may follow.
    Negotiating,
    /// Content is flowing.
    Syncing,
    /// The peer confirmed it holds everything we hold.
    Steady,
    /// The peer is gone.
    Disconnected,
}

/// What we track about one CoValue for one peer.
#[derive(Debug, Clone)]
pub struct CoValuePeerState {
    pub phase: SyncPhase,
    /// What we believe the peer holds, including content in flight.
    pub optimistic: KnownState,
    /// What the peer last told us it holds.
    pub confirmed: Option<KnownState>,
    /// The peer asked for this CoValue (relevant for client peers).
    pub interested: bool,
}

impl CoValuePeerState {
    fn new(id: CoId) -> Self {
        Self {
            phase: SyncPhase::Unknown,
            optimistic: KnownState::empty(id),
            confirmed: None,
            interested: false,
        }
    }
}

/// Per-connection message counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub messages_in: u64,
    pub messages_out: u64,
    pub content_in: u64,
    pub content_out: u64,
    pub transactions_in: u64,
    pub transactions_out: u64,
    pub rejected: u64,
}

/// Protocol state for one connected peer.
pub struct PeerState {
    id: PeerId,
    role: PeerRole,
    priority: u8,
    crash_on_close: bool,
    closed: bool,
    covalues: HashMap<CoId, CoValuePeerState>,
    queue: Arc<PriorityBasedMessageQueue>,
    stats: PeerStats,
}

impl PeerState {
    pub fn new(
        id: PeerId,
        role: PeerRole,
        priority: u8,
        crash_on_close: bool,
        queue: Arc<PriorityBasedMessageQueue>,
    ) -> Self {
        Self {
            id,
            role,
            priority,
            crash_on_close,
            closed: false,
            covalues: HashMap::new(),
            queue,
            stats: PeerStats::default(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn crash_on_close(&self) -> bool {
        self.crash_on_close
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    pub fn queue(&self) -> &Arc<PriorityBasedMessageQueue> {
        &self.queue
    }

    fn entry(&mut self, id: &CoId) -> &mut CoValuePeerState {
        self.covalues
            .entry(*id)
            .or_insert_with(|| CoValuePeerState::new(*id))
    }

    pub fn covalue(&self, id: &CoId) -> Option<&CoValuePeerState> {
        self.covalues.get(id)
    }

    pub fn phase(&self, id: &CoId) -> SyncPhase {
        if self.closed {
            return SyncPhase::Disconnected;
        }
        self.covalues
            .get(id)
            .map(|s| s.phase)
            .unwrap_or(SyncPhase::Unknown)
    }

    /// What we believe the peer holds of `id`.
    pub fn optimistic_known(&self, id: &CoId) -> Option<&KnownState> {
        self.covalues.get(id).map(|s| &s.optimistic)
    }

    pub fn confirmed_known(&self, id: &CoId) -> Option<&KnownState> {
        self.covalues.get(id)?.confirmed.as_ref()
    }

    /// Whether updates to `id` should be pushed to this peer.
    ///
    /// Clients get updates for what they asked for or were sent.
    pub fn wants_updates(&self, id: &CoId) -> bool {
        !self.closed
            && (self.role.is_upstream()
                || self.covalues.get(id).map(|s| s.interested).unwrap_or(false))
    }

    /// CoValues the peer has been involved with.
    pub fn covalue_ids(&self) -> impl Iterator<Item = &CoId> {
        self.covalues.keys()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Incoming
    // ─────────────────────────────────────────────────────────────────────

    /// The peer asked for a CoValue, telling us exactly what it holds.
    pub fn on_load(&mut self, known: &KnownState) {
        self.stats.messages_in += 1;
        let state = self.entry(&known.id);
        state.interested = true;
        state.optimistic = known.clone();
        state.confirmed = Some(known.clone());
        if state.phase == SyncPhase::Unknown {
            state.phase = SyncPhase::Negotiating;
        }
    }

    /// The peer told us what it holds.
    pub fn on_known(&mut self, known: &KnownState, is_correction: bool) {
        self.stats.messages_in += 1;
        let state = self.entry(&known.id);
        if is_correction {
            state.optimistic = known.clone();
        } else {
            state.optimistic.combine_with(known);
        }
        state.confirmed = Some(known.clone());
        if state.phase == SyncPhase::Unknown {
            state.phase = SyncPhase::Negotiating;
        }
    }

    /// The peer sent content; it holds at least what it sent.
    pub fn on_content(&mut self, content: &ContentMessage) {
        self.stats.messages_in += 1;
        self.stats.content_in += 1;
        self.stats.transactions_in += content.transaction_count() as u64;
        let state = self.entry(&content.id);
        state.interested = true;
        if content.header.is_some() {
            state.optimistic.header = true;
        }
        for (session, piece) in &content.new {
            if let Some(end) = piece.end() {
                state.optimistic.update_session(*session, end);
            }
        }
        state.phase = SyncPhase::Syncing;
    }

    pub fn on_rejected(&mut self) {
        self.stats.rejected += 1;
    }

    /// Mark the peer as holding everything we hold of `id`, if it does.
    pub fn update_phase(&mut self, ours: &KnownState) {
        let Some(state) = self.covalues.get_mut(&ours.id) else {
            return;
        };
        let confirmed = state
            .confirmed
            .as_ref()
            .map(|c| ours.is_covered_by(c))
            .unwrap_or(false);
        if confirmed {
            state.phase = SyncPhase::Steady;
        } else if ours.is_covered_by(&state.optimistic) && state.phase != SyncPhase::Unknown {
            state.phase = SyncPhase::Syncing;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outgoing
    // ─────────────────────────────────────────────────────────────────────

    /// Queue a message, updating the optimistic view for content.
    pub fn send(&mut self, message: SyncMessage) -> Result<Dispatch> {
        if self.closed {
            return Err(SyncError::Disconnected);
        }
        self.stats.messages_out += 1;
        match &message {
            SyncMessage::Content(content) => {
                self.stats.content_out += 1;
                self.stats.transactions_out += content.transaction_count() as u64;
                let state = self.entry(&content.id);
                state.interested = true;
                if content.header.is_some() {
                    state.optimistic.header = true;
                }
                for (session, piece) in &content.new {
                    if let Some(end) = piece.end() {
                        state.optimistic.update_session(*session, end);
                    }
                }
                state.phase = SyncPhase::Syncing;
            }
            SyncMessage::Load(known) => {
                let state = self.entry(&known.id);
                if state.phase == SyncPhase::Unknown {
                    state.phase = SyncPhase::Negotiating;
                }
            }
            SyncMessage::Known(_) | SyncMessage::Done(_) => {}
        }
        Ok(self.queue.push(message))
    }

    /// Tear down: forget all per-CoValue state and fail pending sends.
    pub fn close(&mut self) {
        self.closed = true;
        self.covalues.clear();
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Priority;
    use covalent_core::{AccountOrAgent, SessionId, SessionNewContent, Signature, Transaction};
    use std::collections::BTreeMap;

    fn session() -> SessionId {
        SessionId {
            author: AccountOrAgent::Account(CoId([1; 32])),
            suffix: [0; 8],
        }
    }

    fn peer(role: PeerRole) -> PeerState {
        PeerState::new(
            PeerId::new("p"),
            role,
            role.default_priority(),
            false,
            Arc::new(PriorityBasedMessageQueue::new()),
        )
    }

    fn content(id: CoId, after: u32, count: usize) -> ContentMessage {
        let mut new = BTreeMap::new();
        new.insert(
            session(),
            SessionNewContent {
                after,
                new_transactions: (0..count).map(|i| Transaction::trusting(i as i64, vec![])).collect(),
                last_signature: Signature([0; 64]),
            },
        );
        ContentMessage {
            id,
            header: Some(covalent_core::CoValueHeader::group(session().author, 0)),
            new,
            priority: Priority::High,
        }
    }

    #[test]
    fn test_sent_content_advances_optimistic_state() {
        let id = CoId([5; 32]);
        let mut state = peer(PeerRole::Server);
        let _ = state.send(SyncMessage::Content(content(id, 0, 3))).unwrap();

        let known = state.optimistic_known(&id).unwrap();
        assert!(known.header);
        assert_eq!(known.count(&session()), 3);
        assert_eq!(state.phase(&id), SyncPhase::Syncing);
        assert_eq!(state.stats().transactions_out, 3);
    }

    #[test]
    fn test_correction_replaces_optimistic_state() {
        let id = CoId([5; 32]);
        let mut state = peer(PeerRole::Server);
        let _ = state.send(SyncMessage::Content(content(id, 0, 3))).unwrap();

        let mut actual = KnownState::empty(id);
        actual.header = true;
        actual.sessions.insert(session(), 1);
        state.on_known(&actual, true);
        assert_eq!(state.optimistic_known(&id).unwrap().count(&session()), 1);

        // A plain known never lowers the optimistic view.
        let _ = state.send(SyncMessage::Content(content(id, 1, 2))).unwrap();
        state.on_known(&actual, false);
        assert_eq!(state.optimistic_known(&id).unwrap().count(&session()), 3);
    }

    #[test]
    fn test_steady_after_confirmation() {
        let id = CoId([5; 32]);
        let mut state = peer(PeerRole::Client);
        let mut ours = KnownState::empty(id);
        ours.header = true;
        ours.sessions.insert(session(), 2);

        state.on_load(&KnownState::empty(id));
        assert_eq!(state.phase(&id), SyncPhase::Negotiating);
        assert!(state.wants_updates(&id));

        state.on_known(&ours, false);
        state.update_phase(&ours);
        assert_eq!(state.phase(&id), SyncPhase::Steady);
    }

    #[test]
    fn test_clients_only_get_what_they_asked_for() {
        let mut client = peer(PeerRole::Client);
        let server = peer(PeerRole::Server);
        let id = CoId([5; 32]);
        assert!(!client.wants_updates(&id));
        assert!(server.wants_updates(&id));
        client.on_content(&content(id, 0, 1));
        assert!(client.wants_updates(&id));
    }

    #[tokio::test]
    async fn test_close_fails_sends() {
        let id = CoId([5; 32]);
        let mut state = peer(PeerRole::Server);
        let pending = state.send(SyncMessage::Load(KnownState::empty(id))).unwrap();
        state.close();

        assert!(matches!(pending.await, Err(SyncError::Disconnected)));
        assert!(matches!(
            state.send(SyncMessage::Load(KnownState::empty(id))),
            Err(SyncError::Disconnected)
        ));
        assert_eq!(state.phase(&id), SyncPhase::Disconnected);
    }
}
