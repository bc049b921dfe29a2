// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chain preview and application.

use crate::chain::ToolCallChain;
use crate::error::ExecutorError;
use crate::mcp;
use crate::registry::{EventShape, ToolContext, ToolOutcome, ToolRegistry, ToolSpec};
use chrono::Utc;
use saga_canonical::JsonMap;
use saga_config::Features;
use saga_envelope::Event;
use saga_ledger::{AppendEvent, EventLedger};
use saga_rules::Ruleset;
use saga_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One previewed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewItem {
    /// Human-readable mechanics line.
    pub mechanics: String,
    /// Events the step will append when applied.
    pub predicted_events: Vec<EventShape>,
}

/// Dry-run result of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preview {
    /// Per-step preview items, in chain order.
    pub items: Vec<PreviewItem>,
}

impl Preview {
    /// All mechanics lines joined for display.
    #[must_use]
    pub fn mechanics_text(&self) -> String {
        self.items
            .iter()
            .map(|i| i.mechanics.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The first failing step of an applied chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Zero-based index of the failing step.
    pub step_index: usize,
    /// Tool the step invoked.
    pub tool: String,
    /// Failure description.
    pub reason: String,
}

/// Result of applying a chain. The ledger is append-only: events
/// committed before a mid-chain failure remain committed, and a retry
/// with the same `request_id` collapses onto them.
#[derive(Debug)]
pub struct ApplyReport {
    /// The preview computed for the steps that ran.
    pub preview: Preview,
    /// Events appended by this call (or reused from a prior attempt).
    pub applied: Vec<Event>,
    /// The first failure, when the chain did not complete.
    pub failure: Option<StepFailure>,
}

impl ApplyReport {
    /// Whether every step applied.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.failure.is_none()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Previews and applies tool call chains against the ledger.
pub struct Executor {
    ledger: EventLedger,
    ruleset: Arc<dyn Ruleset>,
    registry: ToolRegistry,
    features: Features,
    metrics: Metrics,
}

impl Executor {
    /// Wire an executor to its collaborators.
    #[must_use]
    pub fn new(
        ledger: EventLedger,
        ruleset: Arc<dyn Ruleset>,
        registry: ToolRegistry,
        features: Features,
    ) -> Self {
        let metrics = ledger.metrics().clone();
        Self {
            ledger,
            ruleset,
            registry,
            features,
            metrics,
        }
    }

    /// The ledger this executor appends to.
    #[must_use]
    pub fn ledger(&self) -> &EventLedger {
        &self.ledger
    }

    /// The tool registry backing dispatch.
    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    async fn campaign_for(&self, chain: &ToolCallChain) -> Result<i64, ExecutorError> {
        self.ledger
            .db()
            .campaign_for_scene(chain.scene_id)
            .await?
            .ok_or(ExecutorError::UnknownScene {
                scene_id: chain.scene_id,
            })
    }

    fn dispatch(
        &self,
        spec: &ToolSpec,
        ctx: &ToolContext<'_>,
        args: &JsonMap,
        dry_run: bool,
    ) -> Result<ToolOutcome, ExecutorError> {
        if self.features.mcp {
            self.metrics.inc_counter("executor.mcp.call", 1);
            mcp::invoke(spec, ctx, args, dry_run)
        } else {
            (spec.handler)(ctx, args, dry_run)
        }
    }

    fn step_outcome(
        &self,
        chain: &ToolCallChain,
        overlay: &[Event],
        step_index: usize,
        dry_run: bool,
    ) -> Result<ToolOutcome, ExecutorError> {
        let step = &chain.steps[step_index];
        let spec = self
            .registry
            .get(&step.tool)
            .ok_or_else(|| ExecutorError::UnknownTool {
                name: step.tool.clone(),
            })?;
        let ctx = ToolContext {
            ruleset: self.ruleset.as_ref(),
            scene_events: overlay,
            scene_id: chain.scene_id,
            actor_id: chain.actor_id.as_deref(),
        };
        self.dispatch(spec, &ctx, &step.args, dry_run)
    }

    /// Compute mechanics and predicted events without touching storage.
    ///
    /// Deterministic whenever the steps carry seeds.
    ///
    /// # Errors
    ///
    /// [`ExecutorError`] on unknown scene/tool or handler failure.
    pub async fn execute_chain(&self, chain: &ToolCallChain) -> Result<Preview, ExecutorError> {
        let campaign_id = self.campaign_for(chain).await?;
        let mut overlay = self
            .ledger
            .list_events(campaign_id, Some(chain.scene_id))
            .await?;

        let mut items = Vec::with_capacity(chain.steps.len());
        for index in 0..chain.steps.len() {
            let outcome = self.step_outcome(chain, &overlay, index, true)?;
            for predicted in &outcome.predicted_events {
                overlay.push(synthetic_event(campaign_id, chain.scene_id, predicted));
            }
            items.push(PreviewItem {
                mechanics: outcome.mechanics,
                predicted_events: outcome.predicted_events,
            });
        }
        self.metrics.inc_counter("executor.chain.previewed", 1);
        Ok(Preview { items })
    }

    /// Apply a chain: recompute each step under the encounter lock and
    /// append its predicted events.
    ///
    /// With `features.events` off the chain is previewed but nothing is
    /// appended (shadow mode). A retried `request_id` collapses onto the
    /// originally committed events via idempotency keys.
    ///
    /// # Errors
    ///
    /// [`ExecutorError`] on setup failures (unknown scene, lock or
    /// genesis bootstrap problems). Step-level failures are reported in
    /// the returned [`ApplyReport`] instead, leaving earlier commits in
    /// place.
    pub async fn apply_chain(
        &self,
        chain: &ToolCallChain,
        plan_id: Option<&str>,
        approved_by: Option<&str>,
    ) -> Result<ApplyReport, ExecutorError> {
        if !self.features.events {
            debug!(target: "saga", request_id = %chain.request_id, "events disabled; preview only");
            return Ok(ApplyReport {
                preview: self.execute_chain(chain).await?,
                applied: Vec::new(),
                failure: None,
            });
        }

        let campaign_id = self.campaign_for(chain).await?;
        self.ledger.ensure_genesis(campaign_id).await?;

        let _guard = self
            .ledger
            .locks()
            .acquire(
                self.ledger.db().pg_pool(),
                chain.scene_id,
                self.ledger.lock_timeout(),
            )
            .await
            .map_err(saga_ledger::LedgerError::from)?;

        let mut overlay = self
            .ledger
            .list_events(campaign_id, Some(chain.scene_id))
            .await?;
        let mut items = Vec::with_capacity(chain.steps.len());
        let mut applied = Vec::new();
        let mut failure = None;

        for index in 0..chain.steps.len() {
            let outcome = match self.step_outcome(chain, &overlay, index, false) {
                Ok(outcome) => outcome,
                Err(e) => {
                    failure = Some(StepFailure {
                        step_index: index,
                        tool: chain.steps[index].tool.clone(),
                        reason: e.to_string(),
                    });
                    break;
                }
            };

            let mut step_failed = false;
            for predicted in &outcome.predicted_events {
                let request = AppendEvent {
                    campaign_id,
                    scene_id: Some(chain.scene_id),
                    event_type: &predicted.event_type,
                    payload: predicted.payload.clone(),
                    actor_id: chain.actor_id.clone(),
                    plan_id,
                    execution_request_id: Some(&chain.request_id),
                    approved_by,
                };
                match self.ledger.append_event_under_lock(request).await {
                    Ok(event) => {
                        overlay.push(event.clone());
                        applied.push(event);
                    }
                    Err(e) => {
                        failure = Some(StepFailure {
                            step_index: index,
                            tool: chain.steps[index].tool.clone(),
                            reason: e.to_string(),
                        });
                        step_failed = true;
                        break;
                    }
                }
            }
            items.push(PreviewItem {
                mechanics: outcome.mechanics,
                predicted_events: outcome.predicted_events,
            });
            if step_failed {
                break;
            }
        }

        self.metrics.inc_counter("executor.chain.applied", 1);
        Ok(ApplyReport {
            preview: Preview { items },
            applied,
            failure,
        })
    }
}

/// In-chain stand-in for a predicted event, visible to later steps'
/// folds. Only `event_type` and `payload` matter to folds.
fn synthetic_event(campaign_id: i64, scene_id: i64, predicted: &EventShape) -> Event {
    let mut event = Event::genesis(campaign_id, Utc::now());
    event.scene_id = Some(scene_id);
    event.event_type = predicted.event_type.clone();
    event.payload = predicted.payload.clone();
    event
}
