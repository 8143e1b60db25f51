//! Shared fixtures for integration tests: in-memory storage, published
//! versions and mock node handlers.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowrunner::config::{Config, DatabaseConfig, ExecutionConfig, SchedulerConfig};
use flowrunner::runtime::{Executor, NodeHandler, NodeInvocation, NodeRegistry};
use flowrunner::workflow::registry::VersionCache;
use flowrunner::workflow::storage::EngineStorage;
use flowrunner::workflow::types::{Edge, Node, Workflow, WorkflowRun, WorkflowStatus, WorkflowVersion};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const WORKFLOW_ID: &str = "wf";
pub const TENANT_ID: &str = "tenant-1";

// ============================================================================
// Engine setup
// ============================================================================

pub fn test_config(max_concurrent: usize) -> Config {
    Config {
        database: DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        },
        execution: ExecutionConfig {
            timeout_ms: 5_000,
            max_concurrent,
            retry_policies: HashMap::new(),
        },
        scheduler: SchedulerConfig {
            poll_interval_ms: 20,
            batch_size: 10,
        },
    }
}

pub fn executor(storage: &EngineStorage, nodes: &Arc<NodeRegistry>, config: ExecutionConfig) -> Arc<Executor> {
    Arc::new(Executor::new(
        storage.clone(),
        Arc::clone(nodes),
        Arc::new(VersionCache::new(storage.clone())),
        config,
    ))
}

/// Save the test workflow and a published version with the given graph
pub async fn publish(storage: &EngineStorage, nodes: Vec<Node>, edges: Vec<Edge>) -> WorkflowVersion {
    storage
        .save_workflow(&Workflow {
            id: WORKFLOW_ID.to_string(),
            tenant_id: TENANT_ID.to_string(),
            name: "Test workflow".to_string(),
            status: WorkflowStatus::Active,
        })
        .await
        .unwrap();

    let version = WorkflowVersion {
        id: uuid::Uuid::new_v4().to_string(),
        workflow_id: WORKFLOW_ID.to_string(),
        version_number: 1,
        nodes,
        edges,
        settings: json!({}),
        is_published: false,
        created_at: Utc::now(),
    };
    storage.save_version(&version).await.unwrap();
    assert!(storage.publish_version(WORKFLOW_ID, &version.id).await.unwrap());
    version
}

/// Insert a pending run, as trigger ingestion would
pub async fn pending_run(
    storage: &EngineStorage,
    version: &WorkflowVersion,
    trigger_data: Value,
    event_type: Option<&str>,
) -> WorkflowRun {
    let run = WorkflowRun::new_pending(version, TENANT_ID, trigger_data, event_type);
    storage.create_run(&run).await.unwrap();
    run
}

pub fn node(id: &str, node_type: &str, config: Value) -> Node {
    Node::new(id, node_type, config)
}

/// Poll `condition` until it holds, failing the test after ~5s
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Mock handlers
// ============================================================================

/// Echoes its resolved config and counts invocations
#[derive(Default)]
pub struct Echo {
    pub calls: AtomicUsize,
}

impl Echo {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeHandler for Echo {
    async fn execute(&self, invocation: NodeInvocation<'_>) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "node": invocation.node_id(), "config": invocation.config }))
    }
}

/// Shares one `Echo` between the registry and the test
pub struct SharedEcho(pub Arc<Echo>);

#[async_trait]
impl NodeHandler for SharedEcho {
    async fn execute(&self, invocation: NodeInvocation<'_>) -> anyhow::Result<Value> {
        self.0.execute(invocation).await
    }
}

/// Always fails with the given message
pub struct Fail(pub &'static str);

#[async_trait]
impl NodeHandler for Fail {
    async fn execute(&self, _invocation: NodeInvocation<'_>) -> anyhow::Result<Value> {
        Err(anyhow::anyhow!(self.0))
    }
}

/// Signals a wait until `resume_at`, optionally naming the node to resume at
pub struct Wait {
    pub resume_at: DateTime<Utc>,
    pub next: Option<&'static str>,
}

#[async_trait]
impl NodeHandler for Wait {
    async fn execute(&self, _invocation: NodeInvocation<'_>) -> anyhow::Result<Value> {
        let mut output = json!({ "action": "wait", "resumeAt": self.resume_at.to_rfc3339() });
        if let Some(next) = self.next {
            output["nextNodeId"] = json!(next);
        }
        Ok(output)
    }
}

/// Panics with the given message
pub struct Panic(pub &'static str);

#[async_trait]
impl NodeHandler for Panic {
    async fn execute(&self, _invocation: NodeInvocation<'_>) -> anyhow::Result<Value> {
        panic!("{}", self.0)
    }
}

/// Fails until it has been called `failures + 1` times
pub struct Flaky {
    pub failures: usize,
    pub calls: AtomicUsize,
}

#[async_trait]
impl NodeHandler for Flaky {
    async fn execute(&self, _invocation: NodeInvocation<'_>) -> anyhow::Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(anyhow::anyhow!("transient failure #{}", call + 1))
        } else {
            Ok(json!({ "attempts": call + 1 }))
        }
    }
}

/// Sleeps longer than any test budget
pub struct Slow(pub Duration);

#[async_trait]
impl NodeHandler for Slow {
    async fn execute(&self, _invocation: NodeInvocation<'_>) -> anyhow::Result<Value> {
        tokio::time::sleep(self.0).await;
        Ok(json!({ "slept": true }))
    }
}

/// Cancels its own run from inside the handler
pub struct CancelSelf;

#[async_trait]
impl NodeHandler for CancelSelf {
    async fn execute(&self, invocation: NodeInvocation<'_>) -> anyhow::Result<Value> {
        invocation.storage.cancel_run(&invocation.run.id).await?;
        Ok(json!({ "cancelled": true }))
    }
}

/// Blocks each execution until the test hands out a permit, recording start
/// order (from `trigger_data.n`) and the peak number of concurrent executions
pub struct Gate {
    pub permits: Arc<Semaphore>,
    pub started: Arc<Mutex<Vec<i64>>>,
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
            started: Arc::new(Mutex::new(Vec::new())),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn started(&self) -> Vec<i64> {
        self.started.lock().unwrap().clone()
    }
}

pub struct SharedGate(pub Arc<Gate>);

#[async_trait]
impl NodeHandler for SharedGate {
    async fn execute(&self, invocation: NodeInvocation<'_>) -> anyhow::Result<Value> {
        let gate = &self.0;
        let n = invocation.run.trigger_data["n"].as_i64().unwrap_or(-1);
        gate.started.lock().unwrap().push(n);

        let now_active = gate.active.fetch_add(1, Ordering::SeqCst) + 1;
        gate.peak.fetch_max(now_active, Ordering::SeqCst);

        gate.permits.acquire().await?.forget();

        gate.active.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "n": n }))
    }
}
