//! A store presented to a node as a peer.
//!
//! The node talks to storage with the same four messages it uses for
//! network peers. Storage answers `load` with what it holds, persists
//! `content`, and acknowledges with `known`. Losing the storage peer is
//! fatal to the node, so the returned [`Peer`] has `crash_on_close` set.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use covalent_core::{CoValueHeader, ContentPiece, KnownState};
use covalent_sync::{
    ContentMessage, Peer, PeerEvent, PeerId, PeerRole, Priority, SyncMessage,
    DEFAULT_OUTGOING_CAPACITY,
};

use crate::error::Result;
use crate::traits::{AppendResult, Store, StoreExt, StoredBatch};

/// Answers sync messages from a [`Store`].
pub struct StoragePeer<S: Store + ?Sized> {
    store: Arc<S>,
}

impl<S: Store + ?Sized + 'static> StoragePeer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Spawn a task serving `store` and return the node's end of it.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(store: Arc<S>, id: PeerId) -> Peer {
        Self::spawn_with_capacity(store, id, DEFAULT_OUTGOING_CAPACITY)
    }

    pub fn spawn_with_capacity(store: Arc<S>, id: PeerId, capacity: usize) -> Peer {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(capacity);
        let handler = Self::new(store);
        let peer_id = id.clone();

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let action = message.action();
                let covalue = *message.id();
                let replies = match handler.handle(message).await {
                    Ok(replies) => replies,
                    Err(e) => {
                        tracing::error!(
                            peer = %peer_id,
                            action,
                            covalue = %covalue,
                            error = %e,
                            "storage failed to handle message"
                        );
                        continue;
                    }
                };
                for reply in replies {
                    if event_tx.send(PeerEvent::Message(reply)).await.is_err() {
                        return;
                    }
                }
            }
            tracing::debug!(peer = %peer_id, "storage peer closed");
            let _ = event_tx.send(PeerEvent::Disconnected).await;
        });

        Peer::from_channels(id, PeerRole::Storage, event_rx, out_tx).with_crash_on_close(true)
    }

    /// Handle one message, returning the replies.
    pub async fn handle(&self, message: SyncMessage) -> Result<Vec<SyncMessage>> {
        match message {
            SyncMessage::Load(known) => self.on_load(&known).await,
            SyncMessage::Known(msg) => self.on_known(&msg.known).await,
            SyncMessage::Content(content) => self.on_content(content).await,
            SyncMessage::Done(_) => Ok(Vec::new()),
        }
    }

    async fn on_load(&self, theirs: &KnownState) -> Result<Vec<SyncMessage>> {
        let ours = self.store.known_state(&theirs.id).await?;
        let mut replies = vec![SyncMessage::known(ours.clone())];
        if ours.header {
            replies.extend(self.content_for(theirs).await?);
        }
        Ok(replies)
    }

    async fn on_known(&self, theirs: &KnownState) -> Result<Vec<SyncMessage>> {
        let ours = self.store.known_state(&theirs.id).await?;
        let mut replies = Vec::new();
        if ours.header && ours.is_ahead_of(theirs) {
            replies.extend(self.content_for(theirs).await?);
        }
        if theirs.is_ahead_of(&ours) {
            replies.push(SyncMessage::known(ours));
        }
        Ok(replies)
    }

    async fn on_content(&self, content: ContentMessage) -> Result<Vec<SyncMessage>> {
        let id = content.id;
        match &content.header {
            Some(header) => {
                if header.id()? != id {
                    tracing::warn!(covalue = %id, "header does not match id; not stored");
                    let ours = self.store.known_state(&id).await?;
                    return Ok(vec![SyncMessage::correction(ours)]);
                }
                self.store.put_header(&id, header).await?;
            }
            None => {
                if self.store.get_header(&id).await?.is_none() {
                    tracing::debug!(covalue = %id, "content without header for unknown covalue");
                    return Ok(vec![SyncMessage::correction(KnownState::empty(id))]);
                }
            }
        }

        let mut gap = false;
        for (session, piece) in &content.new {
            match self.store.append_batch(&id, session, piece).await? {
                AppendResult::Gap { known } => {
                    tracing::debug!(
                        covalue = %id,
                        session = %session,
                        known,
                        after = piece.after,
                        "gap in stored session"
                    );
                    gap = true;
                }
                AppendResult::Appended { .. } | AppendResult::AlreadyKnown => {}
            }
        }

        let ours = self.store.known_state(&id).await?;
        Ok(vec![if gap {
            SyncMessage::correction(ours)
        } else {
            SyncMessage::known(ours)
        }])
    }

    /// Content messages covering what the holder of `theirs` lacks.
    async fn content_for(&self, theirs: &KnownState) -> Result<Vec<SyncMessage>> {
        let Some(header) = self.store.get_header(&theirs.id).await? else {
            return Ok(Vec::new());
        };
        let batches = self.store.batches_since(theirs).await?;
        Ok(pack_batches(theirs, header, batches))
    }
}

/// Group batches into messages holding at most one batch per session.
fn pack_batches(
    theirs: &KnownState,
    header: CoValueHeader,
    batches: Vec<StoredBatch>,
) -> Vec<SyncMessage> {
    let priority = Priority::for_header(&header);
    let mut rounds: Vec<ContentPiece> = Vec::new();
    let mut per_session: BTreeMap<_, usize> = BTreeMap::new();

    for batch in batches {
        let round = per_session.entry(batch.session).or_insert(0);
        if rounds.len() <= *round {
            rounds.push(ContentPiece {
                id: theirs.id,
                header: None,
                new: BTreeMap::new(),
            });
        }
        rounds[*round].new.insert(batch.session, batch.to_new_content());
        *round += 1;
    }

    if !theirs.header {
        match rounds.first_mut() {
            Some(first) => first.header = Some(header),
            None => rounds.push(ContentPiece {
                id: theirs.id,
                header: Some(header),
                new: BTreeMap::new(),
            }),
        }
    }

    rounds
        .into_iter()
        .map(|piece| SyncMessage::Content(ContentMessage::from_piece(piece, priority)))
        .collect()
}
