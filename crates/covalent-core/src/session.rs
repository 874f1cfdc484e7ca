//! Session logs: per-session, hash-chained, signed append-only transaction lists.
//!
//! Every batch appended to a session extends a streaming hash over the
//! canonical bytes of all transactions so far. The session's signer signs the
//! running hash at the end of each batch. Signatures are remembered at
//! checkpoints so the log can later be shipped in verifiable chunks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::crypto::{AgentSecret, CryptoProvider, Hash, Signature, StreamingHasher};
use crate::error::{CoreError, ValidationError};
use crate::ids::{SessionId, SignerId};
use crate::transaction::Transaction;

/// Upper bound for the bytes shipped in one content piece.
///
/// A new signature checkpoint is recorded whenever the bytes appended since
/// the previous checkpoint exceed this size.
pub const MAX_RECOMMENDED_TX_SIZE: usize = 100 * 1024;

/// A contiguous run of new transactions for one session.
///
/// `after` is the number of transactions the receiver is assumed to hold;
/// `last_signature` signs the running hash after the last transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionNewContent {
    pub after: u32,
    #[serde(rename = "newTransactions")]
    pub new_transactions: Vec<Transaction>,
    #[serde(rename = "lastSignature")]
    pub last_signature: Signature,
}

impl SessionNewContent {
    /// Number of transactions the receiver holds once this batch is applied,
    /// or `None` if that does not fit a `u32`.
    pub fn end(&self) -> Option<u32> {
        let len = u32::try_from(self.new_transactions.len()).ok()?;
        self.after.checked_add(len)
    }
}

/// Outcome of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New transactions were appended.
    Appended { added: u32 },
    /// Everything in the batch was already known.
    AlreadyKnown,
}

/// One session's transactions plus its hash chain state.
pub struct SessionLog {
    session: SessionId,
    transactions: Vec<Transaction>,
    hasher: Box<dyn StreamingHasher>,
    last_hash: Option<Hash>,
    last_signature: Option<Signature>,
    signature_after: BTreeMap<u32, Signature>,
    bytes_since_checkpoint: usize,
}

impl SessionLog {
    pub fn new(session: SessionId, crypto: &dyn CryptoProvider) -> Self {
        Self {
            session,
            transactions: Vec::new(),
            hasher: crypto.streaming_hash(),
            last_hash: None,
            last_signature: None,
            signature_after: BTreeMap::new(),
            bytes_since_checkpoint: 0,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn last_hash(&self) -> Option<&Hash> {
        self.last_hash.as_ref()
    }

    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    /// Signature checkpoints, keyed by the index of the last covered transaction.
    pub fn signature_checkpoints(&self) -> &BTreeMap<u32, Signature> {
        &self.signature_after
    }

    /// Hash the log would have after appending `txs`, without changing it.
    pub fn expected_hash_after(&self, txs: &[Transaction]) -> Result<Hash, CoreError> {
        let (hasher, _) = self.hash_forward(txs)?;
        Ok(hasher.digest())
    }

    fn hash_forward(&self, txs: &[Transaction]) -> Result<(Box<dyn StreamingHasher>, usize), CoreError> {
        let mut hasher = self.hasher.fork();
        let mut bytes = 0;
        for tx in txs {
            let encoded = tx.hashing_bytes()?;
            bytes += encoded.len();
            hasher.update(&encoded);
        }
        Ok((hasher, bytes))
    }

    /// Validate and append a batch that continues this log at `after`.
    ///
    /// The batch may overlap what is already known; the known prefix is
    /// skipped. The hash over the new suffix must match `expected_hash` (when
    /// given) and `signature` must verify for `signer`. Nothing is changed
    /// unless every check passes.
    pub fn try_add(
        &mut self,
        crypto: &dyn CryptoProvider,
        signer: &SignerId,
        after: u32,
        txs: &[Transaction],
        expected_hash: Option<&Hash>,
        signature: &Signature,
    ) -> Result<AppendOutcome, ValidationError> {
        let known = self.len();
        if after > known {
            return Err(ValidationError::SessionGap {
                session: self.session,
                known,
                after,
            });
        }
        let skip = (known - after) as usize;
        if skip >= txs.len() {
            return Ok(AppendOutcome::AlreadyKnown);
        }
        let new_txs = &txs[skip..];

        let (hasher, bytes) = self.hash_forward(new_txs)?;
        let computed = hasher.digest();
        if let Some(expected) = expected_hash {
            if *expected != computed {
                return Err(ValidationError::HashMismatch {
                    session: self.session,
                    expected: expected.to_string(),
                    computed: computed.to_string(),
                });
            }
        }

        crypto
            .verify(signer, computed.as_bytes(), signature)
            .map_err(|_| ValidationError::InvalidSignature(self.session))?;

        self.commit(new_txs, hasher, computed, *signature, bytes);
        Ok(AppendOutcome::Appended {
            added: new_txs.len() as u32,
        })
    }

    /// Append transactions authored locally, signing the new running hash.
    pub fn add_local(
        &mut self,
        crypto: &dyn CryptoProvider,
        secret: &AgentSecret,
        txs: Vec<Transaction>,
    ) -> Result<Signature, CoreError> {
        if txs.is_empty() {
            return Err(CoreError::EncodingError("empty local batch".into()));
        }
        let (hasher, bytes) = self.hash_forward(&txs)?;
        let hash = hasher.digest();
        let signature = crypto.sign(secret, hash.as_bytes());
        self.commit(&txs, hasher, hash, signature, bytes);
        Ok(signature)
    }

    fn commit(
        &mut self,
        txs: &[Transaction],
        hasher: Box<dyn StreamingHasher>,
        hash: Hash,
        signature: Signature,
        bytes: usize,
    ) {
        self.transactions.extend_from_slice(txs);
        self.hasher = hasher;
        self.last_hash = Some(hash);
        self.last_signature = Some(signature);
        self.bytes_since_checkpoint += bytes;
        if self.bytes_since_checkpoint > MAX_RECOMMENDED_TX_SIZE {
            self.signature_after.insert(self.len() - 1, signature);
            self.bytes_since_checkpoint = 0;
        }
    }

    /// Transactions beyond `known`, split into pieces ending at signatures.
    pub fn new_content_since(&self, known: u32) -> Vec<SessionNewContent> {
        let len = self.len();
        let Some(last_signature) = self.last_signature else {
            return Vec::new();
        };
        if known >= len {
            return Vec::new();
        }

        let mut pieces = Vec::new();
        let mut start = known;
        for (&idx, signature) in self.signature_after.range(known..) {
            if idx + 1 >= len {
                break;
            }
            pieces.push(SessionNewContent {
                after: start,
                new_transactions: self.transactions[start as usize..=idx as usize].to_vec(),
                last_signature: *signature,
            });
            start = idx + 1;
        }
        pieces.push(SessionNewContent {
            after: start,
            new_transactions: self.transactions[start as usize..].to_vec(),
            last_signature,
        });
        pieces
    }
}

impl fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLog")
            .field("session", &self.session)
            .field("len", &self.transactions.len())
            .field("last_hash", &self.last_hash)
            .field("checkpoints", &self.signature_after.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NativeCrypto;
    use crate::ids::{AccountOrAgent, AgentId};
    use proptest::prelude::*;
    use serde_json::json;

    fn setup() -> (NativeCrypto, AgentSecret, AgentId, SessionLog) {
        let crypto = NativeCrypto;
        let secret = crypto.new_agent_secret();
        let agent = crypto.agent_id(&secret);
        let log = SessionLog::new(SessionId::new_random(AccountOrAgent::Agent(agent)), &crypto);
        (crypto, secret, agent, log)
    }

    fn tx(n: i64) -> Transaction {
        Transaction::trusting(n, vec![json!({"op": "set", "key": "k", "value": n})])
    }

    fn text_tx(n: i64, text: &str) -> Transaction {
        Transaction::trusting(n, vec![json!({"op": "set", "key": "k", "value": text})])
    }

    /// Append `original` locally, then offer a replica the same batch with
    /// `tampered` in place of the last transaction. The replica must refuse
    /// it both with and without the expected hash, and stay empty.
    fn assert_tampering_rejected(original: Transaction, tampered: Transaction) {
        let (crypto, secret, agent, mut log) = setup();
        let sig = log.add_local(&crypto, &secret, vec![tx(1), original]).unwrap();
        let mut batch = log.transactions().to_vec();
        *batch.last_mut().unwrap() = tampered;

        let mut replica = SessionLog::new(*log.session(), &crypto);
        let err = replica
            .try_add(&crypto, &agent.signer, 0, &batch, log.last_hash(), &sig)
            .unwrap_err();
        assert!(matches!(err, ValidationError::HashMismatch { .. }));
        let err = replica
            .try_add(&crypto, &agent.signer, 0, &batch, None, &sig)
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidSignature(*log.session()));
        assert!(replica.is_empty());
        assert!(replica.last_hash().is_none());
    }

    proptest! {
        #[test]
        fn test_single_bit_flip_in_value_is_rejected(index in 0usize..8, bit in 0u8..7) {
            let original = "covalent";
            let mut bytes = original.as_bytes().to_vec();
            bytes[index] ^= 1 << bit;
            let flipped = String::from_utf8(bytes).unwrap();
            assert_tampering_rejected(text_tx(2, original), text_tx(2, &flipped));
        }

        #[test]
        fn test_single_bit_flip_in_made_at_is_rejected(bit in 0u32..63) {
            let made_at = 1_700_000_000_000i64;
            assert_tampering_rejected(text_tx(made_at, "x"), text_tx(made_at ^ (1 << bit), "x"));
        }
    }

    fn big_tx(n: i64) -> Transaction {
        Transaction::trusting(n, vec![json!("x".repeat(60 * 1024))])
    }

    #[test]
    fn test_local_append_then_replay_on_fresh_log() {
        let (crypto, secret, agent, mut log) = setup();
        let sig = log.add_local(&crypto, &secret, vec![tx(1), tx(2)]).unwrap();

        let mut replica = SessionLog::new(*log.session(), &crypto);
        let outcome = replica
            .try_add(&crypto, &agent.signer, 0, log.transactions(), log.last_hash(), &sig)
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Appended { added: 2 });
        assert_eq!(replica.last_hash(), log.last_hash());
    }

    #[test]
    fn test_tampered_transaction_is_rejected() {
        let (crypto, secret, agent, mut log) = setup();
        let sig = log.add_local(&crypto, &secret, vec![tx(1)]).unwrap();

        let mut replica = SessionLog::new(*log.session(), &crypto);
        let tampered = vec![tx(2)];
        let err = replica
            .try_add(&crypto, &agent.signer, 0, &tampered, None, &sig)
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidSignature(*log.session()));
        assert!(replica.is_empty());
    }

    #[test]
    fn test_expected_hash_mismatch_is_rejected() {
        let (crypto, secret, agent, mut log) = setup();
        let sig = log.add_local(&crypto, &secret, vec![tx(1)]).unwrap();

        let mut replica = SessionLog::new(*log.session(), &crypto);
        let wrong = Hash::of(b"nope");
        let err = replica
            .try_add(&crypto, &agent.signer, 0, log.transactions(), Some(&wrong), &sig)
            .unwrap_err();
        assert!(matches!(err, ValidationError::HashMismatch { .. }));
        assert!(replica.is_empty());

        let expected = replica.expected_hash_after(log.transactions()).unwrap();
        assert_eq!(Some(&expected), log.last_hash());
        replica
            .try_add(&crypto, &agent.signer, 0, log.transactions(), Some(&expected), &sig)
            .unwrap();
        assert_eq!(replica.len(), 1);
    }

    #[test]
    fn test_wrong_signer_is_rejected() {
        let (crypto, secret, _, mut log) = setup();
        let sig = log.add_local(&crypto, &secret, vec![tx(1)]).unwrap();
        let other = crypto.agent_id(&crypto.new_agent_secret());

        let mut replica = SessionLog::new(*log.session(), &crypto);
        assert!(replica
            .try_add(&crypto, &other.signer, 0, log.transactions(), None, &sig)
            .is_err());
    }

    #[test]
    fn test_gap_is_rejected_and_overlap_is_skipped() {
        let (crypto, secret, agent, mut log) = setup();
        log.add_local(&crypto, &secret, vec![tx(1)]).unwrap();
        let sig = log.add_local(&crypto, &secret, vec![tx(2), tx(3)]).unwrap();

        let mut replica = SessionLog::new(*log.session(), &crypto);
        let err = replica
            .try_add(&crypto, &agent.signer, 1, &log.transactions()[1..], None, &sig)
            .unwrap_err();
        assert!(matches!(err, ValidationError::SessionGap { known: 0, after: 1, .. }));

        let first = log.new_content_since(0);
        assert_eq!(first.len(), 1);
        replica
            .try_add(&crypto, &agent.signer, 0, &first[0].new_transactions, None, &first[0].last_signature)
            .unwrap();
        assert_eq!(replica.len(), 3);

        let again = replica
            .try_add(&crypto, &agent.signer, 0, log.transactions(), None, &sig)
            .unwrap();
        assert_eq!(again, AppendOutcome::AlreadyKnown);
    }

    #[test]
    fn test_new_content_splits_at_checkpoints() {
        let (crypto, secret, agent, mut log) = setup();
        log.add_local(&crypto, &secret, vec![big_tx(1), big_tx(2)]).unwrap();
        log.add_local(&crypto, &secret, vec![tx(3)]).unwrap();
        log.add_local(&crypto, &secret, vec![tx(4)]).unwrap();
        assert_eq!(log.signature_checkpoints().keys().copied().collect::<Vec<_>>(), vec![1]);

        let pieces = log.new_content_since(0);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].after, 0);
        assert_eq!(pieces[0].new_transactions.len(), 2);
        assert_eq!(pieces[1].after, 2);
        assert_eq!(pieces[1].new_transactions.len(), 2);

        let mut replica = SessionLog::new(*log.session(), &crypto);
        for piece in &pieces {
            replica
                .try_add(&crypto, &agent.signer, piece.after, &piece.new_transactions, None, &piece.last_signature)
                .unwrap();
        }
        assert_eq!(replica.last_hash(), log.last_hash());
        assert!(log.new_content_since(4).is_empty());
    }
}
