// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use saga_canonical::{CanonicalError, JsonMap, canonical_bytes, canonical_hash};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Event type reserved for the first event of every campaign.
pub const GENESIS_EVENT_TYPE: &str = "campaign.genesis";

/// `prev_event_hash` of the genesis event.
pub const GENESIS_PREV_EVENT_HASH: [u8; 32] = [0u8; 32];

/// Idempotency key reserved for the genesis event; never produced by
/// [`idempotency_key_v2`] for real payloads.
pub const GENESIS_IDEMPOTENCY_KEY: [u8; 16] = [0u8; 16];

/// Schema version stamped on newly appended events.
pub const EVENT_SCHEMA_VERSION: i32 = 1;

/// Field delimiter for hash material. A non-JSON byte so neither field
/// content nor canonical payload bytes can forge a boundary.
const FIELD_DELIMITER: u8 = 0x1F;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// One immutable row of the per-campaign ledger.
///
/// `wall_time_utc` exists for diagnostics; it participates in the envelope
/// hash (so tampering is detectable) but never in payload hashing or
/// idempotency keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Surrogate database id.
    pub id: i64,
    /// Owning campaign.
    pub campaign_id: i64,
    /// Owning scene, when the event is scoped to one.
    pub scene_id: Option<i64>,
    /// Dense per-campaign ordinal assigned at commit time; `0` is genesis.
    pub replay_ordinal: i64,
    /// Short lowercase event type identifier (e.g. `roll.performed`).
    pub event_type: String,
    /// Version of the payload schema for this event type.
    pub event_schema_version: i32,
    /// Logical game tick; initially equal to `replay_ordinal`.
    pub world_time: i64,
    /// Commit wall-clock time (diagnostics only).
    pub wall_time_utc: DateTime<Utc>,
    /// Envelope hash of the predecessor event; zeroed for genesis.
    pub prev_event_hash: [u8; 32],
    /// SHA-256 over the canonical payload bytes.
    pub payload_hash: [u8; 32],
    /// 16-byte intent fingerprint; unique per campaign.
    pub idempotency_key: [u8; 16],
    /// Acting entity, normalized to a character name when resolvable.
    pub actor_id: Option<String>,
    /// Plan that produced this event, when one exists.
    pub plan_id: Option<String>,
    /// Execution request that produced this event, when one exists.
    pub execution_request_id: Option<String>,
    /// User who confirmed a staged action, when confirmation was required.
    pub approved_by: Option<String>,
    /// Event payload; restricted JSON (integer-only numerics, NFC strings).
    pub payload: JsonMap,
    /// Schema version a migrator rewrote this event from, if any.
    pub migrator_applied_from: Option<i32>,
}

impl Event {
    /// Build the genesis event for a campaign.
    ///
    /// Invariants: ordinal 0, zeroed `prev_event_hash` and
    /// `idempotency_key`, empty payload, `world_time` 0.
    #[must_use]
    pub fn genesis(campaign_id: i64, wall_time_utc: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            campaign_id,
            scene_id: None,
            replay_ordinal: 0,
            event_type: GENESIS_EVENT_TYPE.to_string(),
            event_schema_version: EVENT_SCHEMA_VERSION,
            world_time: 0,
            wall_time_utc,
            prev_event_hash: GENESIS_PREV_EVENT_HASH,
            payload_hash: genesis_payload_hash(),
            idempotency_key: GENESIS_IDEMPOTENCY_KEY,
            actor_id: None,
            plan_id: None,
            execution_request_id: None,
            approved_by: None,
            payload: JsonMap::new(),
            migrator_applied_from: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// SHA-256 over the canonical bytes of `payload`.
///
/// # Errors
///
/// Propagates [`CanonicalError`] when the payload violates the canonical
/// encoding policy.
pub fn payload_hash(payload: &JsonMap) -> Result<[u8; 32], CanonicalError> {
    canonical_hash(payload)
}

/// Payload hash of the genesis event (`canonical_hash({})`).
#[must_use]
pub fn genesis_payload_hash() -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"{}");
    hasher.finalize().into()
}

/// Inputs for [`idempotency_key_v2`].
///
/// `replay_ordinal` is part of the material because the key is computed at
/// the moment the ordinal is claimed; two distinct positions in the chain
/// are distinct intents even with identical payloads.
#[derive(Debug, Clone, Copy)]
pub struct IdempotencyInputs<'a> {
    /// Owning campaign.
    pub campaign_id: i64,
    /// Event type being appended.
    pub event_type: &'a str,
    /// Execution request id, when the append came from the executor.
    pub execution_request_id: Option<&'a str>,
    /// Plan id, when the append came from a validated plan.
    pub plan_id: Option<&'a str>,
    /// Ordinal claimed for the candidate event.
    pub replay_ordinal: i64,
}

/// Derive the 16-byte v2 idempotency key.
///
/// Material: `campaign_id`, `event_type`, `execution_request_id` (empty
/// when absent), `plan_id` (empty when absent), the stringified
/// `replay_ordinal`, and the canonical payload bytes, joined by `0x1F`.
///
/// # Errors
///
/// Propagates [`CanonicalError`] from payload encoding.
pub fn idempotency_key_v2(
    inputs: IdempotencyInputs<'_>,
    payload: &JsonMap,
) -> Result<[u8; 16], CanonicalError> {
    let mut hasher = Sha256::new();
    hasher.update(inputs.campaign_id.to_string().as_bytes());
    hasher.update([FIELD_DELIMITER]);
    hasher.update(inputs.event_type.as_bytes());
    hasher.update([FIELD_DELIMITER]);
    hasher.update(inputs.execution_request_id.unwrap_or("").as_bytes());
    hasher.update([FIELD_DELIMITER]);
    hasher.update(inputs.plan_id.unwrap_or("").as_bytes());
    hasher.update([FIELD_DELIMITER]);
    hasher.update(inputs.replay_ordinal.to_string().as_bytes());
    hasher.update([FIELD_DELIMITER]);
    hasher.update(&canonical_bytes(payload)?);
    let digest: [u8; 32] = hasher.finalize().into();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    Ok(key)
}

/// SHA-256 over the event's identifying fields; the successor stores this
/// as its `prev_event_hash`.
///
/// Field order is fixed: campaign_id, scene_id (empty when absent),
/// replay_ordinal, event_type, event_schema_version, world_time,
/// wall_time_utc as epoch milliseconds, prev_event_hash, payload_hash,
/// idempotency_key, joined by `0x1F`.
#[must_use]
pub fn envelope_hash(event: &Event) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(event.campaign_id.to_string().as_bytes());
    hasher.update([FIELD_DELIMITER]);
    if let Some(scene_id) = event.scene_id {
        hasher.update(scene_id.to_string().as_bytes());
    }
    hasher.update([FIELD_DELIMITER]);
    hasher.update(event.replay_ordinal.to_string().as_bytes());
    hasher.update([FIELD_DELIMITER]);
    hasher.update(event.event_type.as_bytes());
    hasher.update([FIELD_DELIMITER]);
    hasher.update(event.event_schema_version.to_string().as_bytes());
    hasher.update([FIELD_DELIMITER]);
    hasher.update(event.world_time.to_string().as_bytes());
    hasher.update([FIELD_DELIMITER]);
    hasher.update(event.wall_time_utc.timestamp_millis().to_string().as_bytes());
    hasher.update([FIELD_DELIMITER]);
    hasher.update(event.prev_event_hash);
    hasher.update([FIELD_DELIMITER]);
    hasher.update(event.payload_hash);
    hasher.update([FIELD_DELIMITER]);
    hasher.update(event.idempotency_key);
    hasher.finalize().into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn payload(v: serde_json::Value) -> JsonMap {
        v.as_object().cloned().expect("object literal")
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn inputs(ordinal: i64) -> IdempotencyInputs<'static> {
        IdempotencyInputs {
            campaign_id: 1,
            event_type: "roll.performed",
            execution_request_id: Some("req-1"),
            plan_id: Some("plan-1"),
            replay_ordinal: ordinal,
        }
    }

    #[test]
    fn genesis_invariants() {
        let g = Event::genesis(7, t0());
        assert_eq!(g.replay_ordinal, 0);
        assert_eq!(g.event_type, GENESIS_EVENT_TYPE);
        assert_eq!(g.prev_event_hash, [0u8; 32]);
        assert_eq!(g.idempotency_key, [0u8; 16]);
        assert_eq!(g.world_time, 0);
        assert!(g.payload.is_empty());
        assert_eq!(g.payload_hash, genesis_payload_hash());
    }

    #[test]
    fn genesis_payload_hash_matches_canonical_empty_object() {
        assert_eq!(
            genesis_payload_hash(),
            canonical_hash(&JsonMap::new()).unwrap()
        );
    }

    #[test]
    fn same_inputs_same_key() {
        let p = payload(json!({"expr": "1d20", "total": 17}));
        let a = idempotency_key_v2(inputs(3), &p).unwrap();
        let b = idempotency_key_v2(inputs(3), &p).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn ordinal_distinguishes_keys() {
        let p = payload(json!({"expr": "1d20", "total": 17}));
        let a = idempotency_key_v2(inputs(3), &p).unwrap();
        let b = idempotency_key_v2(inputs(4), &p).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn event_type_distinguishes_keys() {
        let p = payload(json!({"target": "a", "amount": 3}));
        let a = idempotency_key_v2(
            IdempotencyInputs {
                event_type: "apply_damage",
                ..inputs(2)
            },
            &p,
        )
        .unwrap();
        let b = idempotency_key_v2(
            IdempotencyInputs {
                event_type: "heal",
                ..inputs(2)
            },
            &p,
        )
        .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn absent_optionals_encode_as_empty() {
        let p = JsonMap::new();
        let none = idempotency_key_v2(
            IdempotencyInputs {
                execution_request_id: None,
                plan_id: None,
                ..inputs(1)
            },
            &p,
        )
        .unwrap();
        let empty = idempotency_key_v2(
            IdempotencyInputs {
                execution_request_id: Some(""),
                plan_id: Some(""),
                ..inputs(1)
            },
            &p,
        )
        .unwrap();
        assert_eq!(none, empty);
    }

    #[test]
    fn key_never_equals_genesis_reserved_key() {
        let p = payload(json!({"n": 1}));
        let k = idempotency_key_v2(inputs(1), &p).unwrap();
        assert_ne!(k, GENESIS_IDEMPOTENCY_KEY);
    }

    #[test]
    fn randomized_collision_suite() {
        use rand::{Rng, SeedableRng, rngs::StdRng};
        use std::collections::HashSet;

        // 1000 distinct inputs must yield 1000 distinct keys.
        let mut rng = StdRng::seed_from_u64(0x5a6a);
        let mut seen = HashSet::new();
        for i in 0..1000i64 {
            let p = payload(json!({
                "n": rng.gen_range(0..1_000_000i64),
                "tag": format!("t{}", rng.gen_range(0..100_000u32)),
            }));
            let key = idempotency_key_v2(
                IdempotencyInputs {
                    campaign_id: rng.gen_range(1..50),
                    event_type: "roll.performed",
                    execution_request_id: Some(&format!("req-{i}")),
                    plan_id: None,
                    replay_ordinal: i,
                },
                &p,
            )
            .unwrap();
            assert!(seen.insert(key), "collision at sample {i}");
        }
    }

    #[test]
    fn envelope_hash_is_stable() {
        let g = Event::genesis(1, t0());
        assert_eq!(envelope_hash(&g), envelope_hash(&g));
    }

    #[test]
    fn envelope_hash_covers_every_identifying_field() {
        let base = Event::genesis(1, t0());
        let h = envelope_hash(&base);

        let mut e = base.clone();
        e.campaign_id = 2;
        assert_ne!(envelope_hash(&e), h);

        let mut e = base.clone();
        e.scene_id = Some(9);
        assert_ne!(envelope_hash(&e), h);

        let mut e = base.clone();
        e.replay_ordinal = 1;
        assert_ne!(envelope_hash(&e), h);

        let mut e = base.clone();
        e.event_type = "roll.performed".into();
        assert_ne!(envelope_hash(&e), h);

        let mut e = base.clone();
        e.world_time = 5;
        assert_ne!(envelope_hash(&e), h);

        let mut e = base.clone();
        e.wall_time_utc = t0() + chrono::Duration::milliseconds(1);
        assert_ne!(envelope_hash(&e), h);

        let mut e = base.clone();
        e.prev_event_hash = [1u8; 32];
        assert_ne!(envelope_hash(&e), h);

        let mut e = base.clone();
        e.payload_hash = [2u8; 32];
        assert_ne!(envelope_hash(&e), h);

        let mut e = base.clone();
        e.idempotency_key = [3u8; 16];
        assert_ne!(envelope_hash(&e), h);
    }

    #[test]
    fn envelope_hash_ignores_payload_body_and_actor() {
        // Only payload_hash participates; the stored payload and the
        // read-ergonomic fields do not.
        let base = Event::genesis(1, t0());
        let h = envelope_hash(&base);

        let mut e = base.clone();
        e.actor_id = Some("Alice".into());
        e.approved_by = Some("user-1".into());
        assert_eq!(envelope_hash(&e), h);
    }

    #[test]
    fn event_serde_roundtrip() {
        let mut e = Event::genesis(3, t0());
        e.payload = payload(json!({"expr": "2d6", "total": 7}));
        e.payload_hash = payload_hash(&e.payload).unwrap();
        let json = serde_json::to_string(&e).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }
}
