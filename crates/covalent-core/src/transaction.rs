//! Transactions: timestamped batches of changes, in the clear or encrypted.

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_bytes;
use crate::crypto::Encrypted;
use crate::error::Result;
use crate::ids::{CoId, KeyId, TransactionId};

/// One entry in a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "lowercase")]
pub enum Transaction {
    /// Changes stored in the clear.
    Trusting {
        #[serde(rename = "madeAt")]
        made_at: i64,
        changes: Vec<serde_json::Value>,
    },

    /// Changes encrypted under a group read key.
    Private {
        #[serde(rename = "madeAt")]
        made_at: i64,
        #[serde(rename = "keyUsed")]
        key_used: KeyId,
        #[serde(rename = "encryptedChanges")]
        encrypted_changes: Encrypted,
    },
}

impl Transaction {
    pub fn trusting(made_at: i64, changes: Vec<serde_json::Value>) -> Self {
        Transaction::Trusting { made_at, changes }
    }

    pub fn made_at(&self) -> i64 {
        match self {
            Transaction::Trusting { made_at, .. } | Transaction::Private { made_at, .. } => *made_at,
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Transaction::Private { .. })
    }

    /// Canonical bytes absorbed by the session's streaming hash.
    pub fn hashing_bytes(&self) -> Result<Vec<u8>> {
        canonical_bytes(self)
    }
}

/// Associated data binding an encrypted payload to its position.
///
/// Used as AEAD associated data so ciphertext cannot be replayed into
/// another CoValue or another slot of the same log.
pub fn encryption_context(co_id: &CoId, tx: &TransactionId) -> Vec<u8> {
    format!("{}/{}", co_id, tx).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trusting_json_shape() {
        let tx = Transaction::trusting(10, vec![json!({"op": "set", "key": "a", "value": 1})]);
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["privacy"], "trusting");
        assert_eq!(json["madeAt"], 10);
        assert_eq!(json["changes"][0]["key"], "a");
    }

    #[test]
    fn test_hashing_bytes_are_stable() {
        let a = Transaction::trusting(10, vec![json!({"key": "a", "op": "set"})]);
        let b = Transaction::trusting(10, vec![json!({"op": "set", "key": "a"})]);
        assert_eq!(a.hashing_bytes().unwrap(), b.hashing_bytes().unwrap());

        let c = Transaction::trusting(11, vec![json!({"op": "set", "key": "a"})]);
        assert_ne!(a.hashing_bytes().unwrap(), c.hashing_bytes().unwrap());
    }

    #[test]
    fn test_made_at() {
        assert_eq!(Transaction::trusting(77, vec![]).made_at(), 77);
        assert!(!Transaction::trusting(77, vec![]).is_private());
    }
}
