//! Structural checks on incoming headers and session batches.
//!
//! Cryptographic checks (hash chain, signatures) happen when a batch is
//! appended to its [`SessionLog`](crate::session::SessionLog); these checks
//! reject obviously malformed input before any work is done.

use crate::error::ValidationError;
use crate::header::{CoValueHeader, CoValueType, Ruleset};
use crate::ids::{CoId, SessionId};
use crate::session::SessionNewContent;
use crate::transaction::Transaction;

/// Maximum number of changes in one transaction.
pub const MAX_CHANGES_PER_TRANSACTION: usize = 10_000;

/// Validate a header received for `id`.
///
/// This performs:
/// - Id check (the header must hash to `id`)
/// - Group rulesets only on map-kind CoValues
/// - Accounts must be groups
pub fn validate_header(id: &CoId, header: &CoValueHeader) -> Result<(), ValidationError> {
    if header.id()? != *id {
        return Err(ValidationError::HeaderMismatch(*id));
    }

    if matches!(header.ruleset, Ruleset::Group { .. }) && header.kind != CoValueType::Comap {
        return Err(ValidationError::StructuralError(
            "group ruleset requires a comap".into(),
        ));
    }

    if header
        .meta
        .as_ref()
        .and_then(|m| m.get("type"))
        .and_then(|t| t.as_str())
        == Some("account")
        && !header.is_group()
    {
        return Err(ValidationError::StructuralError(
            "account header must use the group ruleset".into(),
        ));
    }

    Ok(())
}

/// Validate the shape of a batch before hashing it.
pub fn validate_session_batch(
    session: &SessionId,
    batch: &SessionNewContent,
) -> Result<(), ValidationError> {
    if batch.new_transactions.is_empty() {
        return Err(ValidationError::EmptyBatch(*session));
    }
    if batch.end().is_none() {
        return Err(ValidationError::StructuralError(format!(
            "batch in session {} ends past the maximum log length",
            session
        )));
    }

    for tx in &batch.new_transactions {
        if let Transaction::Trusting { changes, .. } = tx {
            if changes.len() > MAX_CHANGES_PER_TRANSACTION {
                return Err(ValidationError::StructuralError(format!(
                    "transaction with {} changes in session {}",
                    changes.len(),
                    session
                )));
            }
        }
        if tx.made_at() < 0 {
            return Err(ValidationError::StructuralError(format!(
                "negative madeAt in session {}",
                session
            )));
        }
    }

    Ok(())
}
