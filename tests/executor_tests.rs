//! Integration tests for the run executor
//!
//! Each test publishes a small graph into an in-memory store, inserts a
//! pending run and drives it with `Executor::execute_run`.

mod common;

use chrono::{TimeZone, Utc};
use common::*;
use flowrunner::config::RetryPolicy;
use flowrunner::runtime::{NodeRegistry, RunOutcome};
use flowrunner::workflow::storage::EngineStorage;
use flowrunner::workflow::types::{Edge, JobStatus, JobType, NodeRunStatus, RunStatus};
use serde_json::json;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

async fn setup() -> (EngineStorage, Arc<NodeRegistry>) {
    let storage = EngineStorage::in_memory().await.unwrap();
    let nodes = Arc::new(NodeRegistry::with_builtins());
    (storage, nodes)
}

#[tokio::test]
async fn test_linear_run_completes_with_every_output_in_context() {
    let (storage, nodes) = setup().await;
    nodes.register("send_email", Echo::default());

    let version = publish(
        &storage,
        vec![
            node("t", "manual_trigger", json!({})),
            node("a", "send_email", json!({"to": "{{t.email}}", "subject": "Hi {{t.name}}"})),
            node("b", "send_email", json!({"previous": "{{a.config.subject}}"})),
        ],
        vec![Edge::new("t", "a"), Edge::new("a", "b")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({"email": "ada@example.com", "name": "Ada"}), None).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    assert_eq!(executor.execute_run(&run.id).await.unwrap(), RunOutcome::Completed);

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.executed_node_count, 3);
    for key in ["t", "a", "b"] {
        assert!(stored.context.contains_key(key), "context is missing {key}");
    }
    assert_eq!(stored.context["b"]["config"]["previous"], "Hi Ada");
    assert!(stored.completed_at.is_some());
    assert_eq!(stored.current_node_id, None);

    let node_runs = storage.list_node_runs(&run.id).await.unwrap();
    assert_eq!(node_runs.iter().map(|n| n.node_id.as_str()).collect::<Vec<_>>(), vec!["t", "a", "b"]);
    assert!(node_runs.iter().all(|n| n.status == NodeRunStatus::Completed));
    assert_eq!(node_runs[1].input_data, json!({"to": "ada@example.com", "subject": "Hi Ada"}));

    let logs = storage.list_logs(&run.id).await.unwrap();
    assert!(logs.iter().any(|log| log.message.contains("Run completed")));
}

#[tokio::test]
async fn test_wait_suspends_into_exactly_one_delay_job() {
    let (storage, nodes) = setup().await;
    let resume_at = Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap();
    nodes.register("wait_for_reply", Wait { resume_at, next: Some("b") });
    let echo = Arc::new(Echo::default());
    nodes.register("send_email", SharedEcho(Arc::clone(&echo)));

    let version = publish(
        &storage,
        vec![
            node("t", "manual_trigger", json!({})),
            node("w", "wait_for_reply", json!({})),
            node("b", "send_email", json!({})),
        ],
        vec![Edge::new("t", "w"), Edge::new("w", "b")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({}), None).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    assert_eq!(executor.execute_run(&run.id).await.unwrap(), RunOutcome::Waiting { resume_at });

    let jobs = storage.list_jobs_for_run(&run.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_type, JobType::DelayResume);
    assert_eq!(jobs[0].resume_at, resume_at);
    assert_eq!(jobs[0].resume_node_id.as_deref(), Some("b"));
    assert_eq!(jobs[0].status, JobStatus::Pending);

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Waiting);
    assert_eq!(stored.current_node_id.as_deref(), Some("b"));
    assert_eq!(stored.executed_node_count, 2);
    assert_eq!(echo.calls(), 0);
}

#[tokio::test]
async fn test_resumed_run_continues_at_resume_node() {
    let (storage, nodes) = setup().await;
    nodes.register("wait_for_reply", Wait { resume_at: Utc::now(), next: None });
    nodes.register("send_email", Echo::default());

    let version = publish(
        &storage,
        vec![
            node("t", "manual_trigger", json!({})),
            node("w", "wait_for_reply", json!({})),
            node("b", "send_email", json!({})),
        ],
        vec![Edge::new("t", "w"), Edge::new("w", "b")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({}), None).await;
    let executor = executor(&storage, &nodes, test_config(2).execution);

    assert!(matches!(executor.execute_run(&run.id).await.unwrap(), RunOutcome::Waiting { .. }));
    // Without nextNodeId the first successor is the resume point
    let job = &storage.list_jobs_for_run(&run.id).await.unwrap()[0];
    assert_eq!(job.resume_node_id.as_deref(), Some("b"));

    // A waiting run is not executable until it is requeued
    assert_eq!(executor.execute_run(&run.id).await.unwrap(), RunOutcome::Skipped);

    assert!(storage.requeue_waiting_run(&run.id, "b").await.unwrap());
    assert_eq!(executor.execute_run(&run.id).await.unwrap(), RunOutcome::Completed);

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.executed_node_count, 3);
    assert!(stored.context.contains_key("w") && stored.context.contains_key("b"));

    let executed: Vec<String> = storage
        .list_node_runs(&run.id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.node_id)
        .collect();
    assert_eq!(executed, vec!["t", "w", "b"]);
}

#[tokio::test]
async fn test_handler_error_fails_node_and_run_with_same_message() {
    let (storage, nodes) = setup().await;
    nodes.register("explode", Fail("boom"));
    let echo = Arc::new(Echo::default());
    nodes.register("send_email", SharedEcho(Arc::clone(&echo)));

    let version = publish(
        &storage,
        vec![
            node("t", "manual_trigger", json!({})),
            node("a", "explode", json!({})),
            node("b", "send_email", json!({})),
        ],
        vec![Edge::new("t", "a"), Edge::new("a", "b")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({}), None).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    assert_eq!(
        executor.execute_run(&run.id).await.unwrap(),
        RunOutcome::Failed { message: "boom".to_string() }
    );

    let node_runs = storage.list_node_runs(&run.id).await.unwrap();
    let failed = node_runs.iter().find(|n| n.node_id == "a").unwrap();
    assert_eq!(failed.status, NodeRunStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("boom"));

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("boom"));
    assert_eq!(stored.executed_node_count, 1);
    assert_eq!(echo.calls(), 0);
}

#[tokio::test]
async fn test_false_branch_skips_true_path() {
    let (storage, nodes) = setup().await;
    let send = Arc::new(Echo::default());
    nodes.register("send", SharedEcho(Arc::clone(&send)));

    let version = publish(
        &storage,
        vec![
            node("t", "manual_trigger", json!({})),
            node("a", "if_else", json!({"condition": "{{t.score}} > 5"})),
            node("b", "send", json!({})),
            node("c", "stop", json!({})),
        ],
        vec![
            Edge::new("t", "a"),
            Edge::with_handle("a", "b", "true"),
            Edge::with_handle("a", "c", "false"),
        ],
    )
    .await;
    let run = pending_run(&storage, &version, json!({"score": 1}), None).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    assert_eq!(executor.execute_run(&run.id).await.unwrap(), RunOutcome::Completed);

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.executed_node_count, 3);
    assert_eq!(stored.context["a"]["branch"], "false");
    assert!(!stored.context.contains_key("b"));
    assert!(stored.context.contains_key("c"));
    assert_eq!(send.calls(), 0);
}

#[tokio::test]
async fn test_named_variables_drive_conditions() {
    let (storage, nodes) = setup().await;
    nodes.register("send", Echo::default());

    let version = publish(
        &storage,
        vec![
            node("t", "manual_trigger", json!({})),
            node("v", "set_variable", json!({"variable": "tier", "value": "{{t.tier}}"})),
            node("i", "if_else", json!({"condition": "tier == 'gold' && {{t.orders}} >= 3"})),
            node("vip", "send", json!({})),
            node("regular", "send", json!({})),
        ],
        vec![
            Edge::new("t", "v"),
            Edge::new("v", "i"),
            Edge::with_handle("i", "vip", "true"),
            Edge::with_handle("i", "regular", "false"),
        ],
    )
    .await;
    let run = pending_run(&storage, &version, json!({"tier": "gold", "orders": 4}), None).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    assert_eq!(executor.execute_run(&run.id).await.unwrap(), RunOutcome::Completed);

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert!(stored.context.contains_key("vip"));
    assert!(!stored.context.contains_key("regular"));
}

#[tokio::test]
async fn test_stop_ends_run_despite_outgoing_edges() {
    let (storage, nodes) = setup().await;
    let echo = Arc::new(Echo::default());
    nodes.register("send", SharedEcho(Arc::clone(&echo)));

    let version = publish(
        &storage,
        vec![
            node("t", "manual_trigger", json!({})),
            node("s", "stop", json!({"reason": "opted out"})),
            node("b", "send", json!({})),
        ],
        vec![Edge::new("t", "s"), Edge::new("s", "b")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({}), None).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    assert_eq!(executor.execute_run(&run.id).await.unwrap(), RunOutcome::Completed);

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.executed_node_count, 2);
    assert_eq!(stored.context["s"]["reason"], "opted out");
    assert_eq!(echo.calls(), 0);
}

#[tokio::test]
async fn test_only_first_successor_is_followed() {
    let (storage, nodes) = setup().await;
    nodes.register("send", Echo::default());

    let version = publish(
        &storage,
        vec![
            node("t", "manual_trigger", json!({})),
            node("first", "send", json!({})),
            node("second", "send", json!({})),
        ],
        vec![Edge::new("t", "first"), Edge::new("t", "second")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({}), None).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    assert_eq!(executor.execute_run(&run.id).await.unwrap(), RunOutcome::Completed);

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.executed_node_count, 2);
    assert!(stored.context.contains_key("first"));
    assert!(!stored.context.contains_key("second"));

    let logs = storage.list_logs(&run.id).await.unwrap();
    assert!(logs.iter().any(|log| log.message.contains("following only the first")));
}

#[tokio::test]
async fn test_event_type_selects_matching_trigger() {
    let (storage, nodes) = setup().await;
    nodes.register("whatsapp_message", Echo::default());
    nodes.register("email_received", Echo::default());
    nodes.register("send", Echo::default());

    let version = publish(
        &storage,
        vec![
            node("chat", "whatsapp_message", json!({})),
            node("mail", "email_received", json!({})),
            node("reply", "send", json!({})),
        ],
        vec![Edge::new("chat", "reply"), Edge::new("mail", "reply")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({}), Some("email_received")).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    assert_eq!(executor.execute_run(&run.id).await.unwrap(), RunOutcome::Completed);

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert!(stored.context.contains_key("mail"));
    assert!(!stored.context.contains_key("chat"));
    assert_eq!(stored.context["event_type"], "email_received");
    assert_eq!(stored.executed_node_count, 2);
}

#[tokio::test]
async fn test_unknown_node_type_fails_before_any_node_runs() {
    let (storage, nodes) = setup().await;

    let version = publish(
        &storage,
        vec![node("t", "manual_trigger", json!({})), node("x", "mystery_integration", json!({}))],
        vec![Edge::new("t", "x")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({}), None).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    let outcome = executor.execute_run(&run.id).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Failed {
            message: "configuration error: no handler registered for node type(s): mystery_integration".to_string()
        }
    );

    assert!(storage.list_node_runs(&run.id).await.unwrap().is_empty());
    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.executed_node_count, 0);
}

#[tokio::test]
async fn test_execution_budget_times_out_the_run() {
    let (storage, nodes) = setup().await;
    nodes.register("slow", Slow(Duration::from_secs(10)));

    let version = publish(
        &storage,
        vec![node("t", "manual_trigger", json!({})), node("s", "slow", json!({}))],
        vec![Edge::new("t", "s")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({}), None).await;

    let mut config = test_config(2).execution;
    config.timeout_ms = 50;
    let executor = executor(&storage, &nodes, config);

    let message = "workflow execution timed out after 50ms".to_string();
    assert_eq!(
        executor.execute_run(&run.id).await.unwrap(),
        RunOutcome::Failed { message: message.clone() }
    );

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.error_message, Some(message));
}

#[tokio::test]
async fn test_budget_stops_a_cycle_of_fast_nodes() {
    let (storage, nodes) = setup().await;
    nodes.register("send", Echo::default());

    let version = publish(
        &storage,
        vec![
            node("t", "manual_trigger", json!({})),
            node("a", "send", json!({})),
            node("b", "send", json!({})),
        ],
        vec![Edge::new("t", "a"), Edge::new("a", "b"), Edge::new("b", "a")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({}), None).await;

    let mut config = test_config(2).execution;
    config.timeout_ms = 50;
    let executor = executor(&storage, &nodes, config);

    let outcome = tokio::time::timeout(Duration::from_secs(5), executor.execute_run(&run.id))
        .await
        .expect("budget must end the run")
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Failed { message: "workflow execution timed out after 50ms".to_string() }
    );

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert!(stored.executed_node_count >= 1);

    let node_runs = storage.list_node_runs(&run.id).await.unwrap();
    assert!(node_runs.iter().all(|n| n.status != NodeRunStatus::Running));
}

#[tokio::test]
async fn test_handler_panic_fails_node_and_run() {
    let (storage, nodes) = setup().await;
    nodes.register("crash", Panic("kaboom"));

    let version = publish(
        &storage,
        vec![node("t", "manual_trigger", json!({})), node("x", "crash", json!({}))],
        vec![Edge::new("t", "x")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({}), None).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    let message = "node handler panicked: kaboom".to_string();
    assert_eq!(
        executor.execute_run(&run.id).await.unwrap(),
        RunOutcome::Failed { message: message.clone() }
    );

    let node_runs = storage.list_node_runs(&run.id).await.unwrap();
    let crashed = node_runs.iter().find(|n| n.node_id == "x").unwrap();
    assert_eq!(crashed.status, NodeRunStatus::Failed);
    assert_eq!(crashed.error_message, Some(message.clone()));

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.error_message, Some(message));
}

#[tokio::test]
async fn test_out_of_range_delay_fails_instead_of_hanging() {
    let (storage, nodes) = setup().await;

    let version = publish(
        &storage,
        vec![
            node("t", "manual_trigger", json!({})),
            node("d", "delay", json!({"amount": 9_000_000_000_000i64, "unit": "days"})),
        ],
        vec![Edge::new("t", "d")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({}), None).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    let message = "delay node 'd': delay of 9000000000000 days is out of range".to_string();
    assert_eq!(
        executor.execute_run(&run.id).await.unwrap(),
        RunOutcome::Failed { message: message.clone() }
    );

    let node_runs = storage.list_node_runs(&run.id).await.unwrap();
    assert_eq!(node_runs.last().map(|n| n.status), Some(NodeRunStatus::Failed));
    assert!(storage.list_jobs_for_run(&run.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_policy_reattempts_failing_handler() {
    let (storage, nodes) = setup().await;
    let flaky = Arc::new(Flaky { failures: 2, calls: AtomicUsize::new(0) });
    nodes.register_arc("crm_update", flaky.clone());

    let version = publish(
        &storage,
        vec![node("t", "manual_trigger", json!({})), node("c", "crm_update", json!({}))],
        vec![Edge::new("t", "c")],
    )
    .await;

    // Without a policy the first failure is final
    let run = pending_run(&storage, &version, json!({}), None).await;
    let executor_once = executor(&storage, &nodes, test_config(2).execution);
    assert_eq!(
        executor_once.execute_run(&run.id).await.unwrap(),
        RunOutcome::Failed { message: "transient failure #1".to_string() }
    );

    let mut config = test_config(2).execution;
    config
        .retry_policies
        .insert("crm_update".to_string(), RetryPolicy { max_attempts: 3, backoff_ms: 1 });
    let retrying = executor(&storage, &nodes, config);

    let run = pending_run(&storage, &version, json!({}), None).await;
    assert_eq!(retrying.execute_run(&run.id).await.unwrap(), RunOutcome::Completed);

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.context["c"], json!({"attempts": 3}));
}

#[tokio::test]
async fn test_cancellation_stops_before_next_node() {
    let (storage, nodes) = setup().await;
    nodes.register("cancel_me", CancelSelf);
    let echo = Arc::new(Echo::default());
    nodes.register("send", SharedEcho(Arc::clone(&echo)));

    let version = publish(
        &storage,
        vec![
            node("t", "manual_trigger", json!({})),
            node("x", "cancel_me", json!({})),
            node("b", "send", json!({})),
        ],
        vec![Edge::new("t", "x"), Edge::new("x", "b")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({}), None).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    assert_eq!(executor.execute_run(&run.id).await.unwrap(), RunOutcome::Cancelled);

    let stored = storage.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Cancelled);
    assert_eq!(echo.calls(), 0);

    // Cancelling a terminal run is a no-op
    assert!(!executor.cancel_run(&run.id).await.unwrap());
}

#[tokio::test]
async fn test_cancelled_pending_run_is_never_executed() {
    let (storage, nodes) = setup().await;
    let version = publish(&storage, vec![node("t", "manual_trigger", json!({}))], vec![]).await;
    let run = pending_run(&storage, &version, json!({}), None).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    assert!(executor.cancel_run(&run.id).await.unwrap());
    assert_eq!(executor.execute_run(&run.id).await.unwrap(), RunOutcome::Skipped);
    assert!(storage.list_node_runs(&run.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_execution_of_same_run_is_claimed_once() {
    let (storage, nodes) = setup().await;
    nodes.register("send", Echo::default());
    let version = publish(
        &storage,
        vec![node("t", "manual_trigger", json!({})), node("a", "send", json!({}))],
        vec![Edge::new("t", "a")],
    )
    .await;
    let run = pending_run(&storage, &version, json!({}), None).await;

    let executor = executor(&storage, &nodes, test_config(2).execution);
    let (first, second) = tokio::join!(executor.execute_run(&run.id), executor.execute_run(&run.id));
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(|outcome| outcome == &RunOutcome::Skipped);

    assert_eq!(outcomes, vec![RunOutcome::Completed, RunOutcome::Skipped]);
    assert_eq!(storage.list_node_runs(&run.id).await.unwrap().len(), 2);
}
