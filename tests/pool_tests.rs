//! Integration tests for bounded, FIFO run admission

mod common;

use common::*;
use flowrunner::runtime::{ExecutorPool, NodeRegistry, PoolStatus, RunOutcome};
use flowrunner::workflow::storage::EngineStorage;
use flowrunner::workflow::types::{Edge, RunStatus};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[tokio::test]
async fn test_pool_bounds_concurrency_and_admits_in_submission_order() {
    let storage = EngineStorage::in_memory().await.unwrap();
    let nodes = Arc::new(NodeRegistry::new());
    let gate = Arc::new(Gate::new());
    nodes.register("gated", SharedGate(Arc::clone(&gate)));

    let version = publish(&storage, vec![node("g", "gated", json!({}))], vec![]).await;
    let mut run_ids = Vec::new();
    for n in 0..5 {
        run_ids.push(pending_run(&storage, &version, json!({ "n": n }), None).await.id);
    }

    let pool = ExecutorPool::new(executor(&storage, &nodes, test_config(2).execution), 2);
    let handles: Vec<_> = run_ids.iter().map(|id| pool.submit(id.clone())).collect();

    assert_eq!(pool.status(), PoolStatus { active: 2, queued: 3, max_concurrent: 2 });

    wait_until(|| gate.started().len() == 2).await;
    let mut first_two = gate.started();
    first_two.sort_unstable();
    assert_eq!(first_two, vec![0, 1]);

    // Each freed slot goes to the oldest queued run
    for expected in 2..5 {
        gate.permits.add_permits(1);
        wait_until(|| gate.started().len() == expected as usize + 1).await;
        assert_eq!(gate.started()[expected as usize], expected);
        assert!(pool.status().active <= 2);
    }

    gate.permits.add_permits(2);
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), RunOutcome::Completed);
    }

    assert!(gate.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.status(), PoolStatus { active: 0, queued: 0, max_concurrent: 2 });

    for id in &run_ids {
        let run = storage.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }
}

#[tokio::test]
async fn test_failed_run_releases_its_slot() {
    let storage = EngineStorage::in_memory().await.unwrap();
    let nodes = Arc::new(NodeRegistry::with_builtins());
    nodes.register("explode", Fail("boom"));
    nodes.register("send", Echo::default());

    let failing = publish(
        &storage,
        vec![node("t", "manual_trigger", json!({})), node("x", "explode", json!({}))],
        vec![Edge::new("t", "x")],
    )
    .await;
    let failing_run = pending_run(&storage, &failing, json!({}), None).await;

    let healthy = publish(
        &storage,
        vec![node("t", "manual_trigger", json!({})), node("s", "send", json!({}))],
        vec![Edge::new("t", "s")],
    )
    .await;
    let healthy_run = pending_run(&storage, &healthy, json!({}), None).await;

    let pool = ExecutorPool::new(executor(&storage, &nodes, test_config(1).execution), 1);
    let first = pool.submit(failing_run.id.clone());
    let second = pool.submit(healthy_run.id.clone());
    assert_eq!(pool.status().queued, 1);

    assert_eq!(
        first.await.unwrap().unwrap(),
        RunOutcome::Failed { message: "boom".to_string() }
    );
    assert_eq!(second.await.unwrap().unwrap(), RunOutcome::Completed);
    assert_eq!(pool.status(), PoolStatus { active: 0, queued: 0, max_concurrent: 1 });
}

#[tokio::test]
async fn test_zero_max_concurrent_still_admits_one() {
    let storage = EngineStorage::in_memory().await.unwrap();
    let nodes = Arc::new(NodeRegistry::with_builtins());
    let version = publish(&storage, vec![node("t", "manual_trigger", json!({}))], vec![]).await;
    let run = pending_run(&storage, &version, json!({}), None).await;

    let pool = ExecutorPool::new(executor(&storage, &nodes, test_config(0).execution), 0);
    assert_eq!(pool.status().max_concurrent, 1);
    assert_eq!(pool.submit(run.id).await.unwrap().unwrap(), RunOutcome::Completed);
}
