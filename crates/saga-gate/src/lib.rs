// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use saga_ledger::Db;
use saga_plan::{FailedPredicate, PlannerOutput};
use saga_rules::Ability;
use saga_telemetry::Metrics;
use serde_json::Value;

/// DC bounds accepted by the gate.
const DC_MIN: i64 = 1;
const DC_MAX: i64 = 40;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures of the gate itself (not of the evaluated plan).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// The world read-side could not be queried.
    #[error("gate read failed: {reason}")]
    Read {
        /// Backend failure description.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Read seam
// ---------------------------------------------------------------------------

/// The narrow read-only world interface the gate depends on.
#[async_trait]
pub trait CharacterReader: Send + Sync {
    /// Whether a character with this name exists in the campaign.
    async fn character_exists(&self, campaign_id: i64, name: &str) -> Result<bool, GateError>;
}

#[async_trait]
impl CharacterReader for Db {
    async fn character_exists(&self, campaign_id: i64, name: &str) -> Result<bool, GateError> {
        Db::character_exists(self, campaign_id, name)
            .await
            .map_err(|e| GateError::Read {
                reason: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Context the predicates evaluate against.
#[derive(Debug, Clone)]
pub struct PredicateContext {
    /// Campaign whose world is consulted.
    pub campaign_id: i64,
    /// Scene of the request.
    pub scene_id: i64,
    /// Requesting user.
    pub user_id: String,
    /// Actors the caller has pre-authorized for this request.
    pub allowed_actors: Vec<String>,
}

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    /// `true` when no predicate failed.
    pub ok: bool,
    /// Every failed predicate, in evaluation order.
    pub failed: Vec<FailedPredicate>,
}

/// The baseline predicate gate.
#[derive(Debug, Clone)]
pub struct PredicateGate {
    metrics: Metrics,
}

impl PredicateGate {
    /// Create a gate reporting into `metrics`.
    #[must_use]
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }

    /// Evaluate the baseline predicates in order, accumulating failures.
    ///
    /// Order: `known_ability`, `dc_in_bounds`, `exists` (actor),
    /// `actor_in_allowed_actors`. The last two are independent and may
    /// both fire for the same actor, which is informative for callers.
    ///
    /// # Errors
    ///
    /// [`GateError`] only when the world read-side fails; plan
    /// infeasibility is data, not an error.
    pub async fn evaluate(
        &self,
        reader: &impl CharacterReader,
        output: &PlannerOutput,
        context: &PredicateContext,
    ) -> Result<GateOutcome, GateError> {
        let mut failed = Vec::new();

        if let Some(ability) = output.args.get("ability").and_then(Value::as_str)
            && ability.parse::<Ability>().is_err()
        {
            failed.push(FailedPredicate {
                code: "known_ability".to_string(),
                detail: format!("unknown ability '{ability}'"),
            });
        }

        if let Some(dc) = output.args.get("dc").and_then(Value::as_i64)
            && !(DC_MIN..=DC_MAX).contains(&dc)
        {
            failed.push(FailedPredicate {
                code: "dc_in_bounds".to_string(),
                detail: format!("dc {dc} outside {DC_MIN}..={DC_MAX}"),
            });
        }

        if let Some(actor) = output.args.get("actor").and_then(Value::as_str) {
            let in_allowed = context.allowed_actors.iter().any(|a| a == actor);
            let exists = reader.character_exists(context.campaign_id, actor).await?;
            if !exists && !in_allowed {
                failed.push(FailedPredicate {
                    code: "exists".to_string(),
                    detail: format!("actor '{actor}' not found in campaign"),
                });
            }
            if !in_allowed {
                failed.push(FailedPredicate {
                    code: "actor_in_allowed_actors".to_string(),
                    detail: format!("actor '{actor}' not in allowed actors"),
                });
            }
        }

        if failed.is_empty() {
            self.metrics.inc_counter("predicate.gate.ok", 1);
        } else {
            self.metrics.inc_counter("predicate.gate.error", 1);
            for f in &failed {
                self.metrics
                    .inc_counter(&format!("predicate.gate.fail_reason.{}", f.code), 1);
            }
        }

        Ok(GateOutcome {
            ok: failed.is_empty(),
            failed,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
