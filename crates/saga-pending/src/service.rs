// SPDX-License-Identifier: MIT OR Apache-2.0

//! Confirmation and cancellation flows over the pending store.

use crate::store::{PendingStatus, PendingStore};
use crate::{PendingError, StagedChain};
use async_trait::async_trait;
use saga_executor::{ApplyReport, Executor, ToolCallChain, tool_chain_from_execution_request};
use saga_telemetry::{Metrics, field};
use std::sync::Arc;
use tracing::warn;

/// Transport seam for replying to the acting user. The command surface
/// binds this to its channel; delivery retries are its problem, not the
/// pipeline's.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Send `content` to the user, optionally visible only to them.
    async fn send(&self, content: &str, ephemeral: bool);
}

/// Discards all replies (batch jobs, tests that assert elsewhere).
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentResponder;

#[async_trait]
impl Responder for SilentResponder {
    async fn send(&self, _content: &str, _ephemeral: bool) {}
}

/// Result of a `/confirm`.
#[derive(Debug)]
pub enum ConfirmOutcome {
    /// The user had nothing staged.
    NoPending,
    /// The chain applied; the report carries the committed events.
    Confirmed(ApplyReport),
    /// Application failed; the row is marked `error`.
    Failed {
        /// What went wrong.
        reason: String,
    },
}

/// Result of a `/cancel`.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The user had nothing staged.
    NoPending,
    /// The staged action was discarded.
    Canceled,
}

/// Drives staged chains to their terminal state.
pub struct PendingService {
    store: PendingStore,
    metrics: Metrics,
    responder: Arc<dyn Responder>,
    prefer_execution_request: bool,
}

impl PendingService {
    /// Wire the service.
    ///
    /// `prefer_execution_request` mirrors `features.action_validation`:
    /// when on, confirmation reconstructs the chain from the embedded
    /// execution request rather than the raw staged chain.
    #[must_use]
    pub fn new(store: PendingStore, metrics: Metrics, prefer_execution_request: bool) -> Self {
        Self {
            store,
            metrics,
            responder: Arc::new(SilentResponder),
            prefer_execution_request,
        }
    }

    /// Bind the reply channel.
    #[must_use]
    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &PendingStore {
        &self.store
    }

    fn chain_for_apply(&self, staged: &StagedChain) -> ToolCallChain {
        match (&staged.execution_request, self.prefer_execution_request) {
            (Some(request), true) => tool_chain_from_execution_request(request),
            _ => staged.chain.clone(),
        }
    }

    /// Confirm the user's latest staged action and apply it.
    ///
    /// # Errors
    ///
    /// [`PendingError`] on storage failure; application failures are
    /// reported in the outcome and mark the row `error`.
    pub async fn confirm(
        &self,
        executor: &Executor,
        scene_id: i64,
        user_id: &str,
    ) -> Result<ConfirmOutcome, PendingError> {
        let Some(pending) = self
            .store
            .get_latest_pending_for_user(scene_id, user_id)
            .await?
        else {
            self.metrics.inc_counter("pending.confirm.none", 1);
            self.responder.send("No pending action to confirm.", true).await;
            return Ok(ConfirmOutcome::NoPending);
        };

        let chain = self.chain_for_apply(&pending.staged);
        let plan_id = pending.staged.plan_id.clone();
        match executor
            .apply_chain(&chain, plan_id.as_deref(), Some(user_id))
            .await
        {
            Ok(report) if report.complete() => {
                self.store
                    .mark_status(pending.id, PendingStatus::Confirmed)
                    .await?;
                for tx in [pending.player_tx_id, pending.bot_tx_id].into_iter().flatten() {
                    if let Err(e) = self.store.db().set_transcript_status(tx, "finalized").await {
                        warn!(target: "saga", transcript_id = tx, error = %e, "transcript finalize failed");
                    }
                }
                self.metrics.inc_counter("pending.confirm.ok", 1);
                self.responder
                    .send(
                        &format!("{}\n{}", pending.mechanics, pending.narration),
                        false,
                    )
                    .await;
                self.metrics.log_event(
                    "pending",
                    "confirmed",
                    [
                        field("user_id", user_id),
                        field("scene_id", scene_id),
                        field("request_id", pending.request_id.clone()),
                    ],
                );
                Ok(ConfirmOutcome::Confirmed(report))
            }
            Ok(report) => {
                let reason = report
                    .failure
                    .map_or_else(|| "chain failed".to_string(), |f| f.reason);
                self.store.mark_status(pending.id, PendingStatus::Error).await?;
                self.metrics.inc_counter("pending.confirm.error", 1);
                self.responder
                    .send("That action could not be applied.", true)
                    .await;
                Ok(ConfirmOutcome::Failed { reason })
            }
            Err(e) => {
                self.store.mark_status(pending.id, PendingStatus::Error).await?;
                self.metrics.inc_counter("pending.confirm.error", 1);
                self.responder
                    .send("That action could not be applied.", true)
                    .await;
                Ok(ConfirmOutcome::Failed {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Cancel the user's latest staged action.
    ///
    /// The staged narration was never realized, so the player transcript
    /// closes as `error` rather than `finalized`.
    ///
    /// # Errors
    ///
    /// [`PendingError`] on storage failure.
    pub async fn cancel(
        &self,
        scene_id: i64,
        user_id: &str,
    ) -> Result<CancelOutcome, PendingError> {
        let Some(pending) = self
            .store
            .get_latest_pending_for_user(scene_id, user_id)
            .await?
        else {
            self.metrics.inc_counter("pending.cancel.none", 1);
            self.responder.send("No pending action to cancel.", true).await;
            return Ok(CancelOutcome::NoPending);
        };

        self.store
            .mark_status(pending.id, PendingStatus::Canceled)
            .await?;
        if let Some(tx) = pending.player_tx_id
            && let Err(e) = self.store.db().set_transcript_status(tx, "error").await
        {
            warn!(target: "saga", transcript_id = tx, error = %e, "transcript close failed");
        }
        self.metrics.inc_counter("pending.cancel.ok", 1);
        self.responder.send("Pending action canceled.", true).await;
        Ok(CancelOutcome::Canceled)
    }
}
