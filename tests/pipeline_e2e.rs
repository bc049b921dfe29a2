// SPDX-License-Identifier: MIT OR Apache-2.0

//! The full write path: planner → predicate gate → orchestrator →
//! pending store → executor → ledger, with the chain verified at the
//! end.

mod common;

use common::payload;
use saga_config::Settings;
use saga_executor::{ToolCallChain, ToolStep};
use saga_gate::{PredicateContext, PredicateGate};
use saga_ledger::{ChainStatus, verify_hash_chain};
use saga_llm::ScriptedLlm;
use saga_orchestrator::{NoSheets, Orchestrator};
use saga_pending::{
    ConfirmOutcome, CreatePending, PendingService, PendingStore, StagedChain,
};
use saga_plan::PlannerOutput;
use saga_planner::{Planner, default_catalog};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn planner_then_gate_accepts_a_routable_check() {
    let (executor, w) = common::executor_world().await;
    executor
        .ledger()
        .db()
        .create_character(w.campaign_id, "Alice")
        .await
        .unwrap();

    let llm = Arc::new(ScriptedLlm::new([
        r#"{"command": "check", "args": {"ability": "DEX", "dc": 12, "actor": "Alice"}}"#,
    ]));
    let planner = Planner::new(llm, default_catalog(), Settings::default(), w.metrics.clone());
    let plan = planner.plan(w.scene_id, "dodge the swinging blade").await.unwrap();
    assert!(plan.feasible);

    let output = plan.to_planner_output().expect("single step");
    let gate = PredicateGate::new(w.metrics.clone());
    let context = PredicateContext {
        campaign_id: w.campaign_id,
        scene_id: w.scene_id,
        user_id: "user-1".to_string(),
        allowed_actors: vec!["Alice".to_string()],
    };
    let outcome = gate
        .evaluate(executor.ledger().db(), &output, &context)
        .await
        .unwrap();
    assert!(outcome.ok, "failed: {:?}", outcome.failed);
    assert_eq!(w.metrics.get_counter("predicate.gate.ok"), 1);
}

#[tokio::test]
async fn gate_rejects_unknown_ability_with_counter() {
    let (executor, w) = common::executor_world().await;
    let output = PlannerOutput {
        command: "check".to_string(),
        subcommand: None,
        args: payload(json!({"ability": "LCK", "dc": 12})),
        confidence: None,
        rationale: None,
    };
    let gate = PredicateGate::new(w.metrics.clone());
    let context = PredicateContext {
        campaign_id: w.campaign_id,
        scene_id: w.scene_id,
        user_id: "user-1".to_string(),
        allowed_actors: Vec::new(),
    };
    let outcome = gate
        .evaluate(executor.ledger().db(), &output, &context)
        .await
        .unwrap();
    assert!(!outcome.ok);
    assert!(outcome.failed.iter().any(|f| f.code == "known_ability"));
    assert_eq!(w.metrics.get_counter("predicate.gate.error"), 1);
}

#[tokio::test]
async fn orchestrated_action_stages_confirms_and_commits() {
    let (executor, w) = common::executor_world().await;
    let db = executor.ledger().db().clone();
    db.create_character(w.campaign_id, "Alice").await.unwrap();
    db.create_character(w.campaign_id, "goblin").await.unwrap();

    let orchestrator = Orchestrator::new(
        Arc::new(ScriptedLlm::new([
            r#"{"proposal": {"action": "attack", "actor": "Alice", "target": "goblin"},
               "narration": "Alice closes the distance, axe high."}"#,
        ])),
        Arc::new(NoSheets),
        saga_config::Features {
            action_validation: true,
            executor_confirm: true,
            ..saga_config::Features::default()
        },
        w.metrics.clone(),
    );
    let result = orchestrator
        .run(&executor, w.scene_id, "user-1", "attack the goblin", &[])
        .await
        .unwrap();
    assert!(!result.rejected, "reason: {:?}", result.reason);
    let request = result.execution_request.clone().expect("flagged on");
    assert!(request.steps[0].requires_confirmation);

    // Stage it, then confirm it.
    let store = PendingStore::new(db.clone());
    let chain: ToolCallChain =
        serde_json::from_value(result.chain_json.clone().expect("chain_json")).unwrap();
    let staged = StagedChain {
        chain,
        execution_request: Some(request),
        plan_id: None,
    };
    store
        .create(CreatePending {
            campaign_id: w.campaign_id,
            scene_id: w.scene_id,
            channel_id: 1234,
            user_id: "user-1".to_string(),
            request_id: "req-e2e".to_string(),
            staged,
            mechanics: result.mechanics.clone(),
            narration: result.narration.clone(),
            player_tx_id: None,
            bot_tx_id: None,
            ttl_seconds: 120,
        })
        .await
        .unwrap();

    let service = PendingService::new(store, w.metrics.clone(), true);
    let outcome = service.confirm(&executor, w.scene_id, "user-1").await.unwrap();
    let ConfirmOutcome::Confirmed(report) = outcome else {
        panic!("expected Confirmed");
    };
    assert!(report.complete());
    assert!(!report.applied.is_empty());

    // The committed history holds a verifiable chain ending in the
    // attack's outcome event.
    let events = w.ledger.list_events(w.campaign_id, None).await.unwrap();
    let report = verify_hash_chain(&events, &w.metrics);
    assert_eq!(report.status, ChainStatus::Success);
    let last = events.last().expect("nonempty");
    assert!(matches!(
        last.event_type.as_str(),
        "apply_damage" | "attack.missed"
    ));
    assert_eq!(last.approved_by.as_deref(), Some("user-1"));
}

#[tokio::test]
async fn retried_apply_collapses_and_still_verifies() {
    let (executor, w) = common::executor_world().await;
    let chain = ToolCallChain {
        request_id: "req-repeat".to_string(),
        scene_id: w.scene_id,
        actor_id: Some("gm".to_string()),
        steps: vec![ToolStep::new(
            "apply_damage",
            payload(json!({"target": "goblin", "amount": 4})),
        )],
    };
    executor.apply_chain(&chain, None, None).await.unwrap();
    executor.apply_chain(&chain, None, None).await.unwrap();

    let events = w.ledger.list_events(w.campaign_id, None).await.unwrap();
    assert_eq!(events.len(), 2); // genesis + one damage event
    assert_eq!(w.metrics.get_counter("events.idempotent_reuse"), 1);
    assert_eq!(
        verify_hash_chain(&events, &w.metrics).status,
        ChainStatus::Success
    );
}

#[tokio::test]
async fn hp_fold_reflects_the_committed_pipeline_events() {
    let (executor, w) = common::executor_world().await;
    let chain = ToolCallChain {
        request_id: "req-fold".to_string(),
        scene_id: w.scene_id,
        actor_id: None,
        steps: vec![
            ToolStep::new("apply_damage", payload(json!({"target": "hero", "amount": 9}))),
            ToolStep::new("heal", payload(json!({"target": "hero", "amount": 4}))),
        ],
    };
    executor.apply_chain(&chain, None, None).await.unwrap();

    let events = w.ledger.list_events(w.campaign_id, Some(w.scene_id)).await.unwrap();
    let hp = saga_folds::fold_hp_view(&events);
    assert_eq!(hp["hero"], -5);
}
