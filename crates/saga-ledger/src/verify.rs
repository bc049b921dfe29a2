// SPDX-License-Identifier: MIT OR Apache-2.0

//! Full-chain integrity verification.

use saga_canonical::canonical_hash;
use saga_envelope::{Event, envelope_hash};
use saga_telemetry::{Metrics, field};

/// Overall verdict of a chain scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// Every event passed both hash checks.
    Success,
    /// At least one mismatch was found.
    Failure,
}

/// Result of [`verify_hash_chain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    /// Overall verdict.
    pub status: ChainStatus,
    /// Events that passed both checks.
    pub verified_count: usize,
    /// Total events scanned.
    pub chain_length: usize,
    /// Ordinal of the first failing event, when any failed.
    pub first_mismatch_ordinal: Option<i64>,
}

/// Re-traverse a campaign's events and verify the hash chain.
///
/// For every event the stored `payload_hash` is recomputed over the
/// stored payload, and for every event after genesis the predecessor's
/// envelope hash is recomputed and compared with `prev_event_hash`. The
/// scan continues past the first mismatch so a single run reports them
/// all; each mismatch increments `events.hash_mismatch`.
#[must_use]
pub fn verify_hash_chain(events: &[Event], metrics: &Metrics) -> ChainReport {
    let mut verified_count = 0;
    let mut first_mismatch_ordinal = None;

    for (index, event) in events.iter().enumerate() {
        let mut ok = true;

        // A payload that no longer canonicalizes counts as a mismatch;
        // stored payloads were canonical at commit time.
        let payload_ok = matches!(
            canonical_hash(&event.payload),
            Ok(digest) if digest == event.payload_hash
        );
        if !payload_ok {
            ok = false;
            record_mismatch(metrics, event, "payload_hash");
        }

        if index > 0 {
            let expected = envelope_hash(&events[index - 1]);
            if event.prev_event_hash != expected {
                ok = false;
                record_mismatch(metrics, event, "prev_event_hash");
            }
        }

        if ok {
            verified_count += 1;
        } else if first_mismatch_ordinal.is_none() {
            first_mismatch_ordinal = Some(event.replay_ordinal);
        }
    }

    ChainReport {
        status: if first_mismatch_ordinal.is_none() {
            ChainStatus::Success
        } else {
            ChainStatus::Failure
        },
        verified_count,
        chain_length: events.len(),
        first_mismatch_ordinal,
    }
}

fn record_mismatch(metrics: &Metrics, event: &Event, check: &str) {
    metrics.inc_counter("events.hash_mismatch", 1);
    metrics.log_event(
        "events",
        "hash_mismatch",
        [
            field("campaign_id", event.campaign_id),
            field("replay_ordinal", event.replay_ordinal),
            field("check", check),
        ],
    );
}
