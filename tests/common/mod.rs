// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared fixtures for the cross-crate integration suites.
#![allow(dead_code)] // each suite uses the subset it needs

use saga_canonical::JsonMap;
use saga_config::Features;
use saga_executor::{Executor, core_registry};
use saga_ledger::{Db, EventLedger};
use saga_locks::EncounterLocks;
use saga_rules::D20Ruleset;
use saga_telemetry::Metrics;
use std::sync::Arc;
use std::time::Duration;

pub struct World {
    pub ledger: EventLedger,
    pub metrics: Metrics,
    pub campaign_id: i64,
    pub scene_id: i64,
}

/// Route `SAGA_LOG`-filtered tracing output through the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("SAGA_LOG"))
        .with_test_writer()
        .try_init();
}

/// In-memory SQLite world with one campaign and one scene.
pub async fn world() -> World {
    init_tracing();
    let metrics = Metrics::new();
    let db = Db::in_memory().await.expect("in-memory db");
    let campaign_id = db.create_campaign("Integration").await.expect("campaign");
    let scene_id = db.create_scene(campaign_id, 1234).await.expect("scene");
    let ledger = EventLedger::new(
        db,
        EncounterLocks::new(metrics.clone()),
        metrics.clone(),
        Duration::from_secs(3),
    );
    World {
        ledger,
        metrics,
        campaign_id,
        scene_id,
    }
}

/// Executor over a fresh world with events enabled.
pub async fn executor_world() -> (Executor, World) {
    let w = world().await;
    let features = Features {
        events: true,
        combat: true,
        executor: true,
        executor_confirm: true,
        action_validation: true,
        ..Features::default()
    };
    let executor = Executor::new(
        w.ledger.clone(),
        Arc::new(D20Ruleset),
        core_registry(),
        features,
    );
    (executor, w)
}

pub fn payload(v: serde_json::Value) -> JsonMap {
    v.as_object().cloned().expect("object literal")
}
