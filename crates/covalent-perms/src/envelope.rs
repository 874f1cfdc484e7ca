//! Private transactions: encrypting change lists under a group read key.
//!
//! The ciphertext is bound to the CoValue and the transaction's position via
//! [`encryption_context`], so it cannot be replayed elsewhere.

use serde_json::Value;

use covalent_core::{
    encryption_context, CoId, CryptoProvider, DecodedTransaction, Encrypted, KeyId, KeySecret,
    Ruleset, Transaction, TransactionId, VerifiedState,
};

use crate::error::{PermsError, Result};
use crate::keys::KeyResolver;

/// Encrypt `changes` into a private transaction at position `tx`.
pub fn seal_changes(
    crypto: &dyn CryptoProvider,
    co_id: &CoId,
    tx: &TransactionId,
    key: (KeyId, &KeySecret),
    made_at: i64,
    changes: &[Value],
) -> Result<Transaction> {
    let plaintext = serde_json::to_vec(changes)?;
    let encrypted = crypto.encrypt(key.1, &plaintext, &encryption_context(co_id, tx))?;
    Ok(Transaction::Private {
        made_at,
        key_used: key.0,
        encrypted_changes: encrypted,
    })
}

/// Decrypt the change list of a private transaction.
pub fn open_changes(
    crypto: &dyn CryptoProvider,
    co_id: &CoId,
    tx: &TransactionId,
    secret: &KeySecret,
    encrypted: &Encrypted,
) -> Result<Vec<Value>> {
    let plaintext = crypto
        .decrypt(secret, encrypted, &encryption_context(co_id, tx))
        .map_err(|e| PermsError::DecryptionError(e.to_string()))?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// The group whose keys encrypt a CoValue's private transactions.
pub fn key_group(state: &VerifiedState) -> Option<CoId> {
    match &state.header().ruleset {
        Ruleset::OwnedByGroup { group } => Some(*group),
        Ruleset::Group { .. } => Some(*state.id()),
        Ruleset::UnsafeAllowAll => None,
    }
}

/// The valid transactions of a CoValue with their changes in the clear.
///
/// Private transactions whose key is not available (or that fail to
/// decrypt) are left out.
pub fn decode_transactions(keys: &KeyResolver<'_, '_>, state: &VerifiedState) -> Vec<DecodedTransaction> {
    let crypto = keys.crypto();
    let group = key_group(state);
    keys.perms()
        .valid_transactions(state)
        .into_iter()
        .filter_map(|tx| {
            let changes = match tx.tx {
                Transaction::Trusting { changes, .. } => changes.clone(),
                Transaction::Private {
                    key_used,
                    encrypted_changes,
                    ..
                } => {
                    let opened = group
                        .ok_or(PermsError::MissingReadKey(*key_used))
                        .and_then(|g| keys.key_secret(&g, key_used))
                        .and_then(|secret| {
                            open_changes(crypto, state.id(), &tx.id, &secret, encrypted_changes)
                        });
                    match opened {
                        Ok(changes) => changes,
                        Err(e) => {
                            tracing::debug!(id = %state.id(), tx = %tx.id, error = %e, "skipping unreadable transaction");
                            return None;
                        }
                    }
                }
            };
            Some(DecodedTransaction {
                id: tx.id,
                made_at: tx.made_at(),
                changes,
            })
        })
        .collect()
}
