//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use covalent_core::{
    CoId, CoValueHeader, KnownState, SessionId, SessionNewContent, Signature, Transaction,
};

use crate::error::{Result, StoreError};
use crate::traits::{new_suffix, AppendResult, Store, StoredBatch};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    covalues: HashMap<CoId, StoredCoValue>,
}

struct StoredCoValue {
    header: CoValueHeader,
    sessions: BTreeMap<SessionId, StoredSession>,
}

#[derive(Default)]
struct StoredSession {
    transactions: Vec<Transaction>,
    /// Signature after the transaction at each checkpoint index.
    signatures: BTreeMap<u32, Signature>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::InvalidData(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::InvalidData(format!("lock poisoned: {}", e)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_header(&self, id: &CoId, header: &CoValueHeader) -> Result<bool> {
        let mut inner = self.write()?;
        if let Some(existing) = inner.covalues.get(id) {
            if existing.header != *header {
                return Err(StoreError::Conflict(id.to_string()));
            }
            return Ok(false);
        }
        inner.covalues.insert(
            *id,
            StoredCoValue {
                header: header.clone(),
                sessions: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn get_header(&self, id: &CoId) -> Result<Option<CoValueHeader>> {
        Ok(self.read()?.covalues.get(id).map(|c| c.header.clone()))
    }

    async fn list_covalues(&self) -> Result<Vec<CoId>> {
        let mut ids: Vec<CoId> = self.read()?.covalues.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn known_state(&self, id: &CoId) -> Result<KnownState> {
        let inner = self.read()?;
        let mut known = KnownState::empty(*id);
        if let Some(covalue) = inner.covalues.get(id) {
            known.header = true;
            for (session, stored) in &covalue.sessions {
                known
                    .sessions
                    .insert(*session, stored.transactions.len() as u32);
            }
        }
        Ok(known)
    }

    async fn append_batch(
        &self,
        id: &CoId,
        session: &SessionId,
        content: &SessionNewContent,
    ) -> Result<AppendResult> {
        let mut inner = self.write()?;
        let covalue = inner
            .covalues
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let stored = covalue.sessions.entry(*session).or_default();

        let suffix = match new_suffix(stored.transactions.len() as u32, content) {
            Ok(suffix) => suffix,
            Err(result) => return Ok(result),
        };
        stored.transactions.extend_from_slice(suffix);
        let last = stored.transactions.len() as u32 - 1;
        stored.signatures.insert(last, content.last_signature);

        Ok(AppendResult::Appended {
            added: suffix.len() as u32,
        })
    }

    async fn load_batches(&self, id: &CoId) -> Result<Vec<StoredBatch>> {
        let inner = self.read()?;
        let Some(covalue) = inner.covalues.get(id) else {
            return Ok(Vec::new());
        };
        let mut batches = Vec::new();
        for (session, stored) in &covalue.sessions {
            let mut after = 0u32;
            for (&last, signature) in &stored.signatures {
                let end = (last + 1) as usize;
                batches.push(StoredBatch {
                    session: *session,
                    after,
                    transactions: stored.transactions[after as usize..end].to_vec(),
                    signature: *signature,
                });
                after = last + 1;
            }
        }
        Ok(batches)
    }
}
