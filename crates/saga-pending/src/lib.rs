// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod service;
mod store;

pub use service::{CancelOutcome, ConfirmOutcome, PendingService, Responder, SilentResponder};
pub use store::{
    Clock, CreatePending, PendingAction, PendingStatus, PendingStore, dedup_hash,
};

use saga_canonical::CanonicalError;
use saga_executor::ToolCallChain;
use saga_ledger::LedgerError;
use saga_plan::ExecutionRequest;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Staged chain
// ---------------------------------------------------------------------------

/// What a pending row stages: the tool chain, plus the execution
/// request it was lowered from when the action-validation pipeline
/// produced it; confirmation prefers the request as the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedChain {
    /// The chain to apply on confirmation.
    pub chain: ToolCallChain,
    /// Originating execution request, when action validation is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_request: Option<ExecutionRequest>,
    /// Plan provenance for the appended events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
}

impl StagedChain {
    /// Stage a bare chain with no validation provenance.
    #[must_use]
    pub fn bare(chain: ToolCallChain) -> Self {
        Self {
            chain,
            execution_request: None,
            plan_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures from the pending store and its flows.
#[derive(Debug, thiserror::Error)]
pub enum PendingError {
    /// A stored row failed to decode.
    #[error("pending row corrupt: {detail}")]
    Corrupt {
        /// What failed to decode.
        detail: String,
    },

    /// Chain canonicalization for dedup failed.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// The ledger layer failed (transcript finalization).
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The storage backend failed.
    #[error("storage unavailable: {0}")]
    Storage(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use saga_config::Features;
    use saga_executor::{Executor, ToolStep, core_registry, execution_request_from_tool_chain};
    use saga_ledger::{Db, EventLedger};
    use saga_locks::EncounterLocks;
    use saga_rules::D20Ruleset;
    use saga_telemetry::Metrics;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Fixture {
        store: PendingStore,
        executor: Executor,
        metrics: Metrics,
        campaign_id: i64,
        scene_id: i64,
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    async fn fixture() -> Fixture {
        let metrics = Metrics::new();
        let db = Db::in_memory().await.expect("in-memory db");
        let campaign_id = db.create_campaign("Test").await.unwrap();
        let scene_id = db.create_scene(campaign_id, 99).await.unwrap();
        let now = Arc::new(Mutex::new(Utc::now()));
        let clock_now = now.clone();
        let store = PendingStore::new(db.clone())
            .with_clock(Arc::new(move || *clock_now.lock().unwrap()));
        let ledger = EventLedger::new(
            db,
            EncounterLocks::new(metrics.clone()),
            metrics.clone(),
            Duration::from_secs(3),
        );
        let features = Features {
            events: true,
            executor_confirm: true,
            ..Features::default()
        };
        let executor = Executor::new(ledger, Arc::new(D20Ruleset), core_registry(), features);
        Fixture {
            store,
            executor,
            metrics,
            campaign_id,
            scene_id,
            now,
        }
    }

    fn heal_chain(fx: &Fixture, request_id: &str, amount: i64) -> ToolCallChain {
        ToolCallChain {
            request_id: request_id.to_string(),
            scene_id: fx.scene_id,
            actor_id: Some("gm".to_string()),
            steps: vec![ToolStep::new(
                "heal",
                json!({"target": "hero", "amount": amount})
                    .as_object()
                    .cloned()
                    .expect("object literal"),
            )],
        }
    }

    fn create_params(fx: &Fixture, request_id: &str, amount: i64) -> CreatePending {
        CreatePending {
            campaign_id: fx.campaign_id,
            scene_id: fx.scene_id,
            channel_id: 99,
            user_id: "user-1".to_string(),
            request_id: request_id.to_string(),
            staged: StagedChain::bare(heal_chain(fx, request_id, amount)),
            mechanics: format!("hero heals {amount}"),
            narration: "A warm light closes the wound.".to_string(),
            player_tx_id: None,
            bot_tx_id: None,
            ttl_seconds: 300,
        }
    }

    #[tokio::test]
    async fn create_stages_a_pending_row() {
        let fx = fixture().await;
        let pending = fx.store.create(create_params(&fx, "req-1", 3)).await.unwrap();
        assert_eq!(pending.status, PendingStatus::Pending);
        assert_eq!(pending.user_id, "user-1");
        assert_eq!(pending.staged.chain.steps.len(), 1);
        assert!(pending.dedup_hash.is_some());
        assert_eq!(pending.expires_at - pending.created_at, chrono::Duration::seconds(300));
    }

    #[tokio::test]
    async fn identical_chain_dedups_to_existing_row() {
        let fx = fixture().await;
        let first = fx.store.create(create_params(&fx, "req-1", 3)).await.unwrap();
        let second = fx.store.create(create_params(&fx, "req-1", 3)).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn different_chain_creates_a_new_row() {
        let fx = fixture().await;
        let first = fx.store.create(create_params(&fx, "req-1", 3)).await.unwrap();
        let second = fx.store.create(create_params(&fx, "req-2", 5)).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn latest_pending_prefers_newest() {
        let fx = fixture().await;
        fx.store.create(create_params(&fx, "req-1", 3)).await.unwrap();
        let newer = fx.store.create(create_params(&fx, "req-2", 5)).await.unwrap();
        let latest = fx
            .store
            .get_latest_pending_for_user(fx.scene_id, "user-1")
            .await
            .unwrap()
            .expect("has pending");
        assert_eq!(latest.id, newer.id);
    }

    #[tokio::test]
    async fn mark_status_is_single_shot() {
        let fx = fixture().await;
        let pending = fx.store.create(create_params(&fx, "req-1", 3)).await.unwrap();
        assert!(fx
            .store
            .mark_status(pending.id, PendingStatus::Canceled)
            .await
            .unwrap());
        assert!(!fx
            .store
            .mark_status(pending.id, PendingStatus::Confirmed)
            .await
            .unwrap());
        let row = fx.store.get(pending.id).await.unwrap().expect("row exists");
        assert_eq!(row.status, PendingStatus::Canceled);
    }

    #[tokio::test]
    async fn expire_stale_flips_only_overdue_pending_rows() {
        let fx = fixture().await;
        fx.store.create(create_params(&fx, "req-1", 3)).await.unwrap();
        let confirmed = fx.store.create(create_params(&fx, "req-2", 5)).await.unwrap();
        fx.store
            .mark_status(confirmed.id, PendingStatus::Confirmed)
            .await
            .unwrap();

        *fx.now.lock().unwrap() += chrono::Duration::seconds(600);
        assert_eq!(fx.store.expire_stale().await.unwrap(), 1);
        // Idempotent on terminal rows.
        assert_eq!(fx.store.expire_stale().await.unwrap(), 0);

        let row = fx.store.get(confirmed.id).await.unwrap().expect("row exists");
        assert_eq!(row.status, PendingStatus::Confirmed);
    }

    #[tokio::test]
    async fn confirm_applies_and_finalizes() {
        let fx = fixture().await;
        let player_tx = fx
            .store
            .db()
            .create_transcript(fx.scene_id, "user-1", "I bind the wound")
            .await
            .unwrap();
        let mut params = create_params(&fx, "req-1", 3);
        params.player_tx_id = Some(player_tx);
        fx.store.create(params).await.unwrap();

        let service = PendingService::new(fx.store.clone(), fx.metrics.clone(), false);
        let outcome = service
            .confirm(&fx.executor, fx.scene_id, "user-1")
            .await
            .unwrap();
        let ConfirmOutcome::Confirmed(report) = outcome else {
            panic!("expected Confirmed");
        };
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].event_type, "heal");
        assert_eq!(report.applied[0].approved_by.as_deref(), Some("user-1"));
        assert_eq!(fx.metrics.get_counter("pending.confirm.ok"), 1);
        assert_eq!(
            fx.store.db().transcript_status(player_tx).await.unwrap().as_deref(),
            Some("finalized")
        );
    }

    #[tokio::test]
    async fn confirm_without_pending_reports_none() {
        let fx = fixture().await;
        let service = PendingService::new(fx.store.clone(), fx.metrics.clone(), false);
        let outcome = service
            .confirm(&fx.executor, fx.scene_id, "user-1")
            .await
            .unwrap();
        assert!(matches!(outcome, ConfirmOutcome::NoPending));
        assert_eq!(fx.metrics.get_counter("pending.confirm.none"), 1);
    }

    #[tokio::test]
    async fn confirm_prefers_embedded_execution_request_when_flagged() {
        let fx = fixture().await;
        // The raw chain heals 3; the embedded request heals 7. With
        // action validation on, the request wins.
        let raw = heal_chain(&fx, "req-1", 3);
        let validated = heal_chain(&fx, "req-1", 7);
        let request = execution_request_from_tool_chain(&validated, "abcd1234abcd1234");
        let mut params = create_params(&fx, "req-1", 3);
        params.staged = StagedChain {
            chain: raw,
            execution_request: Some(request),
            plan_id: Some("abcd1234abcd1234".to_string()),
        };
        fx.store.create(params).await.unwrap();

        let service = PendingService::new(fx.store.clone(), fx.metrics.clone(), true);
        let outcome = service
            .confirm(&fx.executor, fx.scene_id, "user-1")
            .await
            .unwrap();
        let ConfirmOutcome::Confirmed(report) = outcome else {
            panic!("expected Confirmed");
        };
        assert_eq!(report.applied[0].payload["amount"], 7);
        assert_eq!(
            report.applied[0].plan_id.as_deref(),
            Some("abcd1234abcd1234")
        );
    }

    #[tokio::test]
    async fn failed_confirmation_marks_error() {
        let fx = fixture().await;
        let mut params = create_params(&fx, "req-1", 3);
        params.staged.chain.steps[0].tool = "not_a_tool".to_string();
        let pending = fx.store.create(params).await.unwrap();

        let service = PendingService::new(fx.store.clone(), fx.metrics.clone(), false);
        let outcome = service
            .confirm(&fx.executor, fx.scene_id, "user-1")
            .await
            .unwrap();
        assert!(matches!(outcome, ConfirmOutcome::Failed { .. }));
        assert_eq!(fx.metrics.get_counter("pending.confirm.error"), 1);
        let row = fx.store.get(pending.id).await.unwrap().expect("row exists");
        assert_eq!(row.status, PendingStatus::Error);
    }

    #[tokio::test]
    async fn confirm_replies_through_the_responder() {
        use async_trait::async_trait;
        use std::sync::Mutex as StdMutex;

        #[derive(Default)]
        struct Recording {
            sent: StdMutex<Vec<(String, bool)>>,
        }

        #[async_trait]
        impl Responder for Recording {
            async fn send(&self, content: &str, ephemeral: bool) {
                self.sent.lock().unwrap().push((content.to_string(), ephemeral));
            }
        }

        let fx = fixture().await;
        fx.store.create(create_params(&fx, "req-1", 3)).await.unwrap();

        let responder = Arc::new(Recording::default());
        let service = PendingService::new(fx.store.clone(), fx.metrics.clone(), false)
            .with_responder(responder.clone());
        service.confirm(&fx.executor, fx.scene_id, "user-1").await.unwrap();
        service.confirm(&fx.executor, fx.scene_id, "user-1").await.unwrap();

        let sent = responder.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].0.contains("hero heals 3"));
        assert!(!sent[0].1, "preview reply is public");
        assert_eq!(sent[1].0, "No pending action to confirm.");
        assert!(sent[1].1, "nothing-staged reply is ephemeral");
    }

    #[tokio::test]
    async fn cancel_closes_player_transcript_as_error() {
        let fx = fixture().await;
        let player_tx = fx
            .store
            .db()
            .create_transcript(fx.scene_id, "user-1", "I attack the duke")
            .await
            .unwrap();
        let mut params = create_params(&fx, "req-1", 3);
        params.player_tx_id = Some(player_tx);
        let pending = fx.store.create(params).await.unwrap();

        let service = PendingService::new(fx.store.clone(), fx.metrics.clone(), false);
        let outcome = service.cancel(fx.scene_id, "user-1").await.unwrap();
        assert_eq!(outcome, CancelOutcome::Canceled);
        assert_eq!(fx.metrics.get_counter("pending.cancel.ok"), 1);
        let row = fx.store.get(pending.id).await.unwrap().expect("row exists");
        assert_eq!(row.status, PendingStatus::Canceled);
        assert_eq!(
            fx.store.db().transcript_status(player_tx).await.unwrap().as_deref(),
            Some("error")
        );

        // A second cancel has nothing left to act on.
        let outcome = service.cancel(fx.scene_id, "user-1").await.unwrap();
        assert_eq!(outcome, CancelOutcome::NoPending);
        assert_eq!(fx.metrics.get_counter("pending.cancel.none"), 1);
    }
}
