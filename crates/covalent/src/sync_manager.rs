//! SyncManager: applies incoming sync messages to the registry and decides
//! what to send to each peer.
//!
//! Everything here runs under the node lock, so handlers are synchronous;
//! outgoing messages are only queued, never awaited.
//!
//! Loading asks upstream peers in tiers of equal priority (storage before
//! servers). A tier that answered without the header hands over to the
//! next; when no tier is left the id is marked unavailable.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use covalent_core::{
    AccountOrAgent, AppendOutcome, CoId, CryptoProvider, KnownState, SessionId,
    SessionNewContent, ValidationError,
};
use covalent_perms::PermissionResolver;
use covalent_sync::{
    ContentMessage, KnownMessage, PeerId, PeerRole, PeerState, PeerStats,
    PriorityBasedMessageQueue, SyncMessage,
};
use tracing::{debug, info, warn};

use crate::covalue::{CoValueCore, Registry};

/// An outstanding request for a CoValue.
#[derive(Debug, Default)]
struct PendingLoad {
    /// Peers asked so far.
    asked: BTreeSet<PeerId>,
    /// Asked peers that answered without the header, or went away.
    empty: BTreeSet<PeerId>,
}

/// Per-node sync state: peers, outstanding loads and dependency waits.
#[derive(Default)]
pub(crate) struct SyncManager {
    peers: BTreeMap<PeerId, PeerState>,
    pending: HashMap<CoId, PendingLoad>,
    unavailable: HashSet<CoId>,
    /// Dependency id -> (dependent CoValue, peer that sent it).
    waiting: HashMap<CoId, BTreeSet<(CoId, PeerId)>>,
    /// CoValues client peers asked for that we are fetching upstream.
    deferred: HashMap<CoId, BTreeSet<PeerId>>,
}

impl SyncManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────

    /// Register a peer. Upstream peers are sent a `load` for everything we hold.
    pub(crate) fn add_peer(&mut self, registry: &Registry, state: PeerState) {
        let id = state.id().clone();
        let upstream = state.role().is_upstream();
        if let Some(mut previous) = self.peers.insert(id.clone(), state) {
            previous.close();
        }
        info!(peer = %id, upstream, "peer added");
        if upstream {
            self.unavailable.clear();
            for covalue in registry.ids_by_priority() {
                if let Some(core) = registry.get(&covalue) {
                    self.send(&id, SyncMessage::Load(core.known_state()));
                }
            }
        }
    }

    /// Tear down a peer's state. Returns whether losing it is fatal.
    ///
    /// `queue` identifies the connection: a peer that was replaced under the
    /// same id is left alone.
    pub(crate) fn remove_peer(
        &mut self,
        registry: &Registry,
        id: &PeerId,
        queue: &Arc<PriorityBasedMessageQueue>,
    ) -> bool {
        let current = self
            .peers
            .get(id)
            .map(|p| Arc::ptr_eq(p.queue(), queue))
            .unwrap_or(false);
        if !current {
            return false;
        }
        let Some(mut state) = self.peers.remove(id) else {
            return false;
        };
        state.close();
        info!(peer = %id, stats = ?state.stats(), "peer removed");

        let affected: Vec<CoId> = self
            .pending
            .iter()
            .filter(|(_, load)| load.asked.contains(id))
            .map(|(covalue, _)| *covalue)
            .collect();
        for covalue in affected {
            self.mark_empty(registry, covalue, id);
        }
        for peers in self.deferred.values_mut() {
            peers.remove(id);
        }
        for dependents in self.waiting.values_mut() {
            dependents.retain(|(_, peer)| peer != id);
        }
        state.crash_on_close()
    }

    /// Close every peer, ending their dispatchers.
    pub(crate) fn close_all(&mut self) {
        for state in self.peers.values_mut() {
            state.close();
        }
        self.peers.clear();
    }

    pub(crate) fn has_peer(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub(crate) fn peer_stats(&self, id: &PeerId) -> Option<PeerStats> {
        self.peers.get(id).map(|p| p.stats().clone())
    }

    pub(crate) fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn is_unavailable(&self, id: &CoId) -> bool {
        self.unavailable.contains(id)
    }

    /// Forget that `id` was unavailable, so it is asked for again.
    pub(crate) fn retry(&mut self, id: &CoId) {
        self.unavailable.remove(id);
    }

    /// Whether a request for `id` is still being answered.
    pub(crate) fn is_loading(&self, id: &CoId) -> bool {
        self.pending.contains_key(id)
    }

    /// Ask upstream peers for `id` unless a request is already out.
    pub(crate) fn request_load(&mut self, registry: &Registry, id: CoId) {
        if self.pending.contains_key(&id) || self.unavailable.contains(&id) {
            return;
        }
        self.pending.insert(id, PendingLoad::default());
        self.ask_next_tier(registry, id);
    }

    fn ask_next_tier(&mut self, registry: &Registry, id: CoId) {
        let Some(load) = self.pending.get(&id) else {
            return;
        };
        let candidates: Vec<(u8, PeerId)> = self
            .peers
            .values()
            .filter(|p| p.role().is_upstream() && !p.is_closed() && !load.asked.contains(p.id()))
            .map(|p| (p.priority(), p.id().clone()))
            .collect();
        let Some(tier) = candidates.iter().map(|(priority, _)| *priority).min() else {
            self.pending.remove(&id);
            if !registry.contains(&id) {
                self.mark_unavailable(id);
            }
            return;
        };

        let known = registry
            .get(&id)
            .map(CoValueCore::known_state)
            .unwrap_or_else(|| KnownState::empty(id));
        for (_, peer) in candidates.into_iter().filter(|(p, _)| *p == tier) {
            debug!(covalue = %id, peer = %peer, "requesting");
            if let Some(load) = self.pending.get_mut(&id) {
                load.asked.insert(peer.clone());
            }
            self.send(&peer, SyncMessage::Load(known.clone()));
        }
    }

    /// An asked peer does not have `id`.
    fn mark_empty(&mut self, registry: &Registry, id: CoId, peer: &PeerId) {
        let Some(load) = self.pending.get_mut(&id) else {
            return;
        };
        if !load.asked.contains(peer) {
            return;
        }
        load.empty.insert(peer.clone());
        if load.asked.is_subset(&load.empty) {
            if registry.contains(&id) {
                self.pending.remove(&id);
            } else {
                self.ask_next_tier(registry, id);
            }
        }
    }

    fn mark_unavailable(&mut self, id: CoId) {
        debug!(covalue = %id, "unavailable from all peers");
        self.unavailable.insert(id);
        if let Some(peers) = self.deferred.remove(&id) {
            for peer in peers {
                self.send(&peer, SyncMessage::known(KnownState::empty(id)));
            }
        }
    }

    /// Finish a request once we hold what every asked peer said it holds.
    fn settle(&mut self, registry: &Registry, id: &CoId) {
        let Some(load) = self.pending.get(id) else {
            return;
        };
        let Some(core) = registry.get(id) else {
            return;
        };
        let ours = core.known_state();
        let behind = load.asked.iter().any(|peer| {
            self.peers
                .get(peer)
                .and_then(|p| p.confirmed_known(id))
                .map(|theirs| theirs.is_ahead_of(&ours))
                .unwrap_or(false)
        });
        if !behind {
            self.pending.remove(id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Incoming
    // ─────────────────────────────────────────────────────────────────────

    /// Apply one message from `peer`. Returns the CoValues that changed.
    pub(crate) fn handle(
        &mut self,
        registry: &mut Registry,
        crypto: &dyn CryptoProvider,
        peer: &PeerId,
        message: SyncMessage,
    ) -> Vec<CoId> {
        if !self.peers.contains_key(peer) {
            debug!(peer = %peer, action = message.action(), "message from unknown peer dropped");
            return Vec::new();
        }
        debug!(peer = %peer, action = message.action(), covalue = %message.id(), "received");
        match message {
            SyncMessage::Load(known) => {
                self.on_load(registry, peer, known);
                Vec::new()
            }
            SyncMessage::Known(known) => {
                self.on_known(registry, peer, known);
                Vec::new()
            }
            SyncMessage::Content(content) => self.on_content(registry, crypto, peer, content),
            SyncMessage::Done(_) => Vec::new(),
        }
    }

    fn on_load(&mut self, registry: &Registry, peer: &PeerId, theirs: KnownState) {
        let id = theirs.id;
        let role = match self.peers.get_mut(peer) {
            Some(state) => {
                state.on_load(&theirs);
                state.role()
            }
            None => return,
        };

        if let Some(core) = registry.get(&id) {
            let ours = core.known_state();
            self.send(peer, SyncMessage::known(ours));
            self.push_content(registry, peer, &id, &mut BTreeSet::new());
            return;
        }

        if role == PeerRole::Client {
            self.request_load(registry, id);
            if self.pending.contains_key(&id) {
                self.deferred.entry(id).or_default().insert(peer.clone());
                return;
            }
        }
        self.send(peer, SyncMessage::known(KnownState::empty(id)));
    }

    fn on_known(&mut self, registry: &Registry, peer: &PeerId, message: KnownMessage) {
        let KnownMessage {
            known: theirs,
            is_correction,
        } = message;
        let id = theirs.id;
        match self.peers.get_mut(peer) {
            Some(state) => state.on_known(&theirs, is_correction),
            None => return,
        }

        if !theirs.header && !registry.contains(&id) {
            self.mark_empty(registry, id, peer);
            return;
        }
        if registry.contains(&id) {
            self.push_content(registry, peer, &id, &mut BTreeSet::new());
            if let (Some(core), Some(state)) = (registry.get(&id), self.peers.get_mut(peer)) {
                state.update_phase(&core.known_state());
            }
            if !theirs.header {
                self.mark_empty(registry, id, peer);
            }
            self.settle(registry, &id);
        }
    }

    fn on_content(
        &mut self,
        registry: &mut Registry,
        crypto: &dyn CryptoProvider,
        peer: &PeerId,
        content: ContentMessage,
    ) -> Vec<CoId> {
        let id = content.id;
        if !self.peers.contains_key(peer) {
            return Vec::new();
        }
        if let Some(session) = content
            .new
            .iter()
            .find_map(|(session, piece)| piece.end().is_none().then_some(session))
        {
            warn!(peer = %peer, covalue = %id, %session, "rejecting content past the maximum log length");
            self.reject(peer);
            return Vec::new();
        }
        if let Some(state) = self.peers.get_mut(peer) {
            state.on_content(&content);
        }

        let mut changed = false;
        if !registry.contains(&id) {
            let Some(header) = content.header.clone() else {
                debug!(peer = %peer, covalue = %id, "content without header for unknown covalue");
                self.send(peer, SyncMessage::correction(KnownState::empty(id)));
                return Vec::new();
            };
            match CoValueCore::new(id, header) {
                Ok(core) => {
                    registry.insert(core);
                    changed = true;
                }
                Err(e) => {
                    warn!(peer = %peer, covalue = %id, error = %e, "rejecting header");
                    self.reject(peer);
                    return Vec::new();
                }
            }
        }

        let outcome = apply_sessions(registry, crypto, peer, id, content.new);
        changed |= outcome.appended;
        for _ in 0..outcome.rejected {
            self.reject(peer);
        }

        for account in &outcome.unresolved {
            self.waiting
                .entry(*account)
                .or_default()
                .insert((id, peer.clone()));
            self.request_load(registry, *account);
        }

        if let Some(core) = registry.get(&id) {
            let ours = core.known_state();
            let reply = if outcome.gap {
                SyncMessage::correction(ours.clone())
            } else {
                SyncMessage::known(ours.clone())
            };
            self.send(peer, reply);
            if let Some(state) = self.peers.get_mut(peer) {
                state.update_phase(&ours);
            }
        }

        if outcome.rejected > 0 {
            self.pending.remove(&id);
        } else {
            self.settle(registry, &id);
        }

        if !changed {
            return Vec::new();
        }
        self.on_changed(registry, &id, Some(peer));
        vec![id]
    }

    fn reject(&mut self, peer: &PeerId) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.on_rejected();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outgoing
    // ─────────────────────────────────────────────────────────────────────

    /// Propagate a change of `id` to everyone interested, except `source`.
    pub(crate) fn on_changed(&mut self, registry: &Registry, id: &CoId, source: Option<&PeerId>) {
        if let Some(dependents) = self.waiting.remove(id) {
            for (dependent, peer) in dependents {
                let known = registry
                    .get(&dependent)
                    .map(CoValueCore::known_state)
                    .unwrap_or_else(|| KnownState::empty(dependent));
                debug!(covalue = %dependent, dependency = %id, peer = %peer, "re-requesting");
                self.pending
                    .entry(dependent)
                    .or_default()
                    .asked
                    .insert(peer.clone());
                self.send(&peer, SyncMessage::Load(known));
            }
        }

        if let Some(peers) = self.deferred.remove(id) {
            for peer in peers {
                self.push_content(registry, &peer, id, &mut BTreeSet::new());
            }
        }

        let targets: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| Some(p.id()) != source && p.wants_updates(id))
            .map(|p| p.id().clone())
            .collect();
        for peer in targets {
            self.push_content(registry, &peer, id, &mut BTreeSet::new());
        }
    }

    /// Queue what `peer` lacks of `id`, dependencies first.
    fn push_content(
        &mut self,
        registry: &Registry,
        peer: &PeerId,
        id: &CoId,
        visited: &mut BTreeSet<CoId>,
    ) {
        if !visited.insert(*id) {
            return;
        }
        let Some(core) = registry.get(id) else {
            return;
        };
        let dependencies = core.dependencies(&PermissionResolver::new(registry));
        for dependency in &dependencies {
            self.push_content(registry, peer, dependency, visited);
        }

        let Some(state) = self.peers.get(peer) else {
            return;
        };
        let theirs = state.optimistic_known(id).cloned();
        for message in core.content_since(theirs.as_ref()) {
            self.send(peer, SyncMessage::Content(message));
        }
    }

    fn send(&mut self, peer: &PeerId, message: SyncMessage) {
        let Some(state) = self.peers.get_mut(peer) else {
            return;
        };
        let action = message.action();
        if let Err(e) = state.send(message) {
            debug!(peer = %peer, action, error = %e, "send failed");
        }
    }
}

/// What applying a content message's sessions did.
#[derive(Debug, Default)]
struct SessionsOutcome {
    appended: bool,
    gap: bool,
    rejected: usize,
    /// Accounts whose current agent could not be resolved.
    unresolved: BTreeSet<CoId>,
}

/// Append each session of a content message to `id`.
///
/// Sessions whose signer cannot be resolved yet are retried after the
/// others, since an account's own sessions can make its agent known.
fn apply_sessions(
    registry: &mut Registry,
    crypto: &dyn CryptoProvider,
    peer: &PeerId,
    id: CoId,
    new: BTreeMap<SessionId, SessionNewContent>,
) -> SessionsOutcome {
    let mut outcome = SessionsOutcome::default();
    let mut remaining: Vec<(SessionId, SessionNewContent)> = new.into_iter().collect();

    loop {
        let mut progressed = false;
        let mut unresolved = Vec::new();
        for (session, batch) in remaining {
            let signer = PermissionResolver::new(registry).signer_for(&session.author);
            let signer = match signer {
                Ok(signer) => signer,
                Err(_) => {
                    unresolved.push((session, batch));
                    continue;
                }
            };
            let Some(core) = registry.get_mut(&id) else {
                return outcome;
            };
            match core.try_add(crypto, session, &signer, &batch) {
                Ok(AppendOutcome::Appended { added }) => {
                    debug!(covalue = %id, session = %session, added, "appended");
                    outcome.appended = true;
                    progressed = true;
                }
                Ok(AppendOutcome::AlreadyKnown) => {}
                Err(ValidationError::SessionGap { known, after, .. }) => {
                    debug!(covalue = %id, session = %session, known, after, "gap in session");
                    outcome.gap = true;
                }
                Err(e) => {
                    warn!(peer = %peer, covalue = %id, session = %session, error = %e, "rejecting batch");
                    outcome.rejected += 1;
                }
            }
        }
        remaining = unresolved;
        if !progressed || remaining.is_empty() {
            break;
        }
    }

    for (session, _) in remaining {
        if let AccountOrAgent::Account(account) = session.author {
            debug!(covalue = %id, %account, "signer unresolved");
            outcome.unresolved.insert(account);
        }
    }
    outcome
}
