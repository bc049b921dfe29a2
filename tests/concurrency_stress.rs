// SPDX-License-Identifier: MIT OR Apache-2.0

//! Concurrent writers must produce a dense, verifiable chain.

mod common;

use common::payload;
use saga_ledger::{AppendEvent, ChainStatus, verify_hash_chain};
use serde_json::json;
use std::collections::HashSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_appends_produce_dense_ordinals() {
    const TASKS: i64 = 16;

    let w = common::world().await;
    w.ledger.ensure_genesis(w.campaign_id).await.unwrap();

    let mut handles = Vec::new();
    for n in 0..TASKS {
        let ledger = w.ledger.clone();
        let campaign_id = w.campaign_id;
        let scene_id = w.scene_id;
        handles.push(tokio::spawn(async move {
            let mut request = AppendEvent::new(
                campaign_id,
                "heal",
                payload(json!({"target": "hero", "amount": n})),
            );
            request.scene_id = Some(scene_id);
            ledger.append_event(request).await
        }));
    }
    for handle in handles {
        handle.await.expect("task").expect("append");
    }

    let events = w.ledger.list_events(w.campaign_id, None).await.unwrap();
    assert_eq!(events.len() as i64, TASKS + 1); // genesis + one per task

    let ordinals: Vec<i64> = events.iter().map(|e| e.replay_ordinal).collect();
    assert_eq!(ordinals, (0..=TASKS).collect::<Vec<_>>());

    let keys: HashSet<[u8; 16]> = events.iter().map(|e| e.idempotency_key).collect();
    assert_eq!(keys.len() as i64, TASKS + 1);

    let report = verify_hash_chain(&events, &w.metrics);
    assert_eq!(report.status, ChainStatus::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bootstrap_creates_one_genesis() {
    let w = common::world().await;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = w.ledger.clone();
        let campaign_id = w.campaign_id;
        handles.push(tokio::spawn(async move {
            ledger.ensure_genesis(campaign_id).await
        }));
    }
    let mut ids = HashSet::new();
    for handle in handles {
        let genesis = handle.await.expect("task").expect("genesis");
        ids.insert(genesis.id);
        assert_eq!(genesis.replay_ordinal, 0);
    }
    assert_eq!(ids.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_campaigns_do_not_interfere() {
    let w = common::world().await;
    let other_campaign = w.ledger.db().create_campaign("Other").await.unwrap();
    w.ledger.ensure_genesis(w.campaign_id).await.unwrap();
    w.ledger.ensure_genesis(other_campaign).await.unwrap();

    let mut handles = Vec::new();
    for (campaign, n) in [(w.campaign_id, 3), (other_campaign, 4)] {
        for i in 0..n {
            let ledger = w.ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .append_event(AppendEvent::new(
                        campaign,
                        "heal",
                        payload(json!({"target": "t", "amount": i})),
                    ))
                    .await
            }));
        }
    }
    for handle in handles {
        handle.await.expect("task").expect("append");
    }

    let first = w.ledger.list_events(w.campaign_id, None).await.unwrap();
    let second = w.ledger.list_events(other_campaign, None).await.unwrap();
    assert_eq!(first.len(), 4);
    assert_eq!(second.len(), 5);
    assert_eq!(verify_hash_chain(&first, &w.metrics).status, ChainStatus::Success);
    assert_eq!(verify_hash_chain(&second, &w.metrics).status, ChainStatus::Success);
}
