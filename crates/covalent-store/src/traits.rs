//! Store trait: the abstract interface for CoValue persistence.
//!
//! This trait allows the engine to be storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;

use covalent_core::{
    CoId, CoValueHeader, KnownState, SessionId, SessionNewContent, Signature, Transaction,
};

use crate::error::Result;

/// Result of appending a batch to a stored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// New transactions were stored.
    Appended { added: u32 },
    /// Everything in the batch was already stored (idempotent - not an error).
    AlreadyKnown,
    /// The batch starts beyond what is stored; nothing was written.
    Gap { known: u32 },
}

/// A stored run of transactions ending at a signature checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBatch {
    pub session: SessionId,
    pub after: u32,
    pub transactions: Vec<Transaction>,
    pub signature: Signature,
}

impl StoredBatch {
    /// Number of transactions held after this batch.
    pub fn end(&self) -> u32 {
        let len = u32::try_from(self.transactions.len()).unwrap_or(u32::MAX);
        self.after.saturating_add(len)
    }

    pub fn to_new_content(&self) -> SessionNewContent {
        SessionNewContent {
            after: self.after,
            new_transactions: self.transactions.clone(),
            last_signature: self.signature,
        }
    }
}

/// The Store trait: async interface for CoValue persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Verification is upstream**: the store keeps what it is given; hashes
///   and signatures are checked by the node before content reaches storage.
/// - **Contiguous sessions**: a batch must start at or before the stored
///   count. The overlapping prefix is skipped; a gap is reported, not stored.
/// - **Checkpoints preserved**: each appended batch records its signature at
///   its last index, so stored sessions are replayed in the same chunks.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // CoValue Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a header. Returns `false` if it was already stored.
    async fn put_header(&self, id: &CoId, header: &CoValueHeader) -> Result<bool>;

    /// Get a CoValue's header.
    async fn get_header(&self, id: &CoId) -> Result<Option<CoValueHeader>>;

    /// List all stored CoValues.
    async fn list_covalues(&self) -> Result<Vec<CoId>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Session Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// What the store holds of a CoValue (`header: false` if unknown).
    async fn known_state(&self, id: &CoId) -> Result<KnownState>;

    /// Append a batch of transactions to a session.
    async fn append_batch(
        &self,
        id: &CoId,
        session: &SessionId,
        content: &SessionNewContent,
    ) -> Result<AppendResult>;

    /// All stored batches of a CoValue, ordered by session then position.
    async fn load_batches(&self, id: &CoId) -> Result<Vec<StoredBatch>>;
}

/// Extension trait for convenience methods.
#[async_trait]
pub trait StoreExt: Store {
    /// Stored batches the holder of `known` is missing.
    ///
    /// Batches that the peer holds only partly are returned whole; the
    /// receiver skips the prefix it already has.
    async fn batches_since(&self, known: &KnownState) -> Result<Vec<StoredBatch>> {
        Ok(self
            .load_batches(&known.id)
            .await?
            .into_iter()
            .filter(|batch| batch.end() > known.count(&batch.session))
            .collect())
    }
}

impl<T: Store + ?Sized> StoreExt for T {}

/// Number of transactions of `content` that lie beyond `stored`.
///
/// Shared by the store implementations to apply the contiguity rule.
pub(crate) fn new_suffix(
    stored: u32,
    content: &SessionNewContent,
) -> std::result::Result<&[Transaction], AppendResult> {
    if content.after > stored {
        return Err(AppendResult::Gap { known: stored });
    }
    let skip = (stored - content.after) as usize;
    if skip >= content.new_transactions.len() {
        return Err(AppendResult::AlreadyKnown);
    }
    Ok(&content.new_transactions[skip..])
}
