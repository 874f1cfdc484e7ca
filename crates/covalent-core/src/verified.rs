//! Verified state of one CoValue: its header and every session log.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::{AgentSecret, CryptoProvider, Hash, Signature};
use crate::error::{CoreError, ValidationError};
use crate::header::CoValueHeader;
use crate::ids::{CoId, SessionId, SignerId, TransactionId};
use crate::known_state::KnownState;
use crate::session::{AppendOutcome, SessionLog, SessionNewContent};
use crate::transaction::Transaction;

/// Everything a peer is missing of a CoValue, grouped per session.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentPiece {
    pub id: CoId,
    pub header: Option<CoValueHeader>,
    pub new: BTreeMap<SessionId, SessionNewContent>,
}

impl ContentPiece {
    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.is_empty()
    }
}

/// A transaction together with its position, as seen when merging sessions.
#[derive(Debug, Clone, Copy)]
pub struct TxRef<'a> {
    pub id: TransactionId,
    pub tx: &'a Transaction,
}

impl TxRef<'_> {
    pub fn made_at(&self) -> i64 {
        self.tx.made_at()
    }
}

/// Header plus session logs, each transaction hash- and signature-checked.
#[derive(Debug)]
pub struct VerifiedState {
    id: CoId,
    header: CoValueHeader,
    sessions: BTreeMap<SessionId, SessionLog>,
}

impl VerifiedState {
    /// Start from a header, checking it hashes to `id`.
    pub fn new(id: CoId, header: CoValueHeader) -> Result<Self, ValidationError> {
        if header.id()? != id {
            return Err(ValidationError::HeaderMismatch(id));
        }
        Ok(Self {
            id,
            header,
            sessions: BTreeMap::new(),
        })
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    pub fn sessions(&self) -> &BTreeMap<SessionId, SessionLog> {
        &self.sessions
    }

    pub fn session(&self, session: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    /// Validate and append a batch for `session`, atomically.
    #[allow(clippy::too_many_arguments)]
    pub fn try_add_transactions(
        &mut self,
        crypto: &dyn CryptoProvider,
        session: SessionId,
        signer: &SignerId,
        after: u32,
        txs: &[Transaction],
        expected_hash: Option<&Hash>,
        signature: &Signature,
    ) -> Result<AppendOutcome, ValidationError> {
        if txs.is_empty() {
            return Err(ValidationError::EmptyBatch(session));
        }
        match self.sessions.get_mut(&session) {
            Some(log) => log.try_add(crypto, signer, after, txs, expected_hash, signature),
            None => {
                let mut log = SessionLog::new(session, crypto);
                let outcome = log.try_add(crypto, signer, after, txs, expected_hash, signature)?;
                self.sessions.insert(session, log);
                Ok(outcome)
            }
        }
    }

    /// Append locally authored transactions to our own session.
    pub fn add_local_transactions(
        &mut self,
        crypto: &dyn CryptoProvider,
        session: SessionId,
        secret: &AgentSecret,
        txs: Vec<Transaction>,
    ) -> Result<Signature, CoreError> {
        self.sessions
            .entry(session)
            .or_insert_with(|| SessionLog::new(session, crypto))
            .add_local(crypto, secret, txs)
    }

    /// Next transaction index in `session`.
    pub fn next_tx_index(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).map(|log| log.len()).unwrap_or(0)
    }

    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: true,
            sessions: self
                .sessions
                .iter()
                .map(|(session, log)| (*session, log.len()))
                .collect(),
        }
    }

    /// Everything beyond `known`, or `None` when the peer is up to date.
    ///
    /// Sessions are returned as a list of pieces so each piece can travel in
    /// its own `content` message, chunked at signature checkpoints.
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Option<Vec<ContentPiece>> {
        let send_header = !known.map(|k| k.header).unwrap_or(false);

        let mut per_session: Vec<(SessionId, Vec<SessionNewContent>)> = Vec::new();
        for (session, log) in &self.sessions {
            let their = known.map(|k| k.count(session)).unwrap_or(0);
            let pieces = log.new_content_since(their);
            if !pieces.is_empty() {
                per_session.push((*session, pieces));
            }
        }

        if !send_header && per_session.is_empty() {
            return None;
        }

        // Round i carries the i-th piece of every session.
        let rounds = per_session.iter().map(|(_, p)| p.len()).max().unwrap_or(0).max(1);
        let mut out = Vec::with_capacity(rounds);
        for round in 0..rounds {
            let mut new = BTreeMap::new();
            for (session, pieces) in &per_session {
                if let Some(piece) = pieces.get(round) {
                    new.insert(*session, piece.clone());
                }
            }
            out.push(ContentPiece {
                id: self.id,
                header: (round == 0 && send_header).then(|| self.header.clone()),
                new,
            });
        }
        Some(out)
    }

    /// All transactions, ordered by (madeAt, session, index).
    pub fn transactions_in_merge_order(&self) -> Vec<TxRef<'_>> {
        let mut all: Vec<TxRef<'_>> = self
            .sessions
            .iter()
            .flat_map(|(session, log)| {
                log.transactions().iter().enumerate().map(move |(i, tx)| TxRef {
                    id: TransactionId {
                        session: *session,
                        tx_index: i as u32,
                    },
                    tx,
                })
            })
            .collect();
        all.sort_by(|a, b| (a.made_at(), a.id).cmp(&(b.made_at(), b.id)));
        all
    }
}
