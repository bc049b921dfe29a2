// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ledger failure taxonomy.

use saga_canonical::CanonicalError;
use saga_locks::LockError;

/// Failures surfaced by the event ledger repository.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The ledger is in a state the append algorithm cannot proceed from
    /// (e.g. a missing genesis event).
    #[error("ledger inconsistent: {detail}")]
    Inconsistent {
        /// What was found to be wrong.
        detail: String,
    },

    /// Two distinct payloads computed the same idempotency key. Treated
    /// as a hard bug; the operation is aborted and escalated.
    #[error("idempotency key collision for campaign {campaign_id}, event type {event_type}")]
    IdempotencyCollision {
        /// Campaign the collision occurred in.
        campaign_id: i64,
        /// Event type of the colliding candidate.
        event_type: String,
    },

    /// Concurrent writers exhausted the bounded retry budget.
    #[error("ledger contention: gave up after {attempts} attempts")]
    Contention {
        /// Number of insert attempts made.
        attempts: u32,
    },

    /// A database-side integrity guard rejected the write (ordinal gap or
    /// uniqueness violation outside the retry path).
    #[error("ledger integrity violation: {detail}")]
    Integrity {
        /// Database-reported violation detail.
        detail: String,
    },

    /// The payload violated the canonical encoding policy.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// The encounter lock could not be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The storage backend failed or is unavailable.
    #[error("storage unavailable: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Classification of an insert failure, used to pick the recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertViolation {
    /// `(campaign_id, idempotency_key)` unique violation; an idempotent
    /// reuse candidate.
    IdempotencyKey,
    /// `(campaign_id, replay_ordinal)` unique violation or dense-ordinal
    /// trigger abort; a concurrent writer claimed the ordinal first.
    Ordinal,
    /// Anything else.
    Other,
}

pub(crate) fn classify_insert_error(err: &sqlx::Error) -> InsertViolation {
    let Some(db_err) = err.as_database_error() else {
        return InsertViolation::Other;
    };
    let message = db_err.message();
    if message.contains("replay_ordinal gap") {
        return InsertViolation::Ordinal;
    }
    if db_err.is_unique_violation() {
        let constraint = db_err.constraint().unwrap_or("");
        if constraint.contains("idempotency") || message.contains("idempotency_key") {
            return InsertViolation::IdempotencyKey;
        }
        if constraint.contains("replay") || message.contains("replay_ordinal") {
            return InsertViolation::Ordinal;
        }
    }
    InsertViolation::Other
}
