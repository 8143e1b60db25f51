/// Run executor: drives one run through its version's graph
///
/// Nodes execute strictly one after another. After every completed node the
/// context, executed-node count and next node id are persisted, so a restart
/// resumes at exactly the next node. A `wait` output suspends the run into a
/// durable delay job and releases the caller; a `stop` output or a node without
/// successors completes it. Handler errors fail the node and the run with the
/// same message.

use crate::{
    config::ExecutionConfig,
    error::EngineError,
    runtime::{
        context::{add_to_context, resolve_config},
        graph::{find_next_nodes, find_trigger_node, is_branching_node},
        registry::{NodeHandler, NodeInvocation, NodeRegistry, RunLogger},
    },
    workflow::{
        registry::VersionCache,
        storage::EngineStorage,
        types::{Node, NodeRun, RunContext, RunStatus, ScheduledJob, WorkflowRun, WorkflowVersion},
    },
};
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use futures::FutureExt;
use serde_json::{json, Value};
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::time::Instant;

/// How a single execution pass of a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Suspended on a delay; a `delay_resume` job will requeue it
    Waiting { resume_at: DateTime<Utc> },
    Failed { message: String },
    Cancelled,
    /// The run was not pending, e.g. another worker already claimed it
    Skipped,
}

/// Control signal carried by a handler's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Follow successors, filtered by `branch` for branching nodes
    Continue { branch: Option<String> },
    Wait {
        resume_at: DateTime<Utc>,
        next_node_id: Option<String>,
    },
    Stop,
}

impl NodeOutcome {
    /// Interpret a handler output
    ///
    /// `resumeAt` may be an RFC 3339 string or epoch milliseconds.
    pub fn from_output(output: &Value) -> Result<Self, EngineError> {
        match output.get("action").and_then(Value::as_str) {
            Some("wait") => {
                let resume_at = match output.get("resumeAt") {
                    Some(Value::String(text)) => DateTime::parse_from_rfc3339(text)
                        .map(|at| at.with_timezone(&Utc))
                        .map_err(|e| EngineError::Handler(format!("invalid resumeAt '{}': {}", text, e)))?,
                    Some(Value::Number(millis)) => millis
                        .as_i64()
                        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                        .ok_or_else(|| EngineError::Handler(format!("invalid resumeAt {}", millis)))?,
                    _ => return Err(EngineError::Handler("wait action requires resumeAt".to_string())),
                };
                let next_node_id = output.get("nextNodeId").and_then(Value::as_str).map(str::to_string);
                Ok(Self::Wait { resume_at, next_node_id })
            }
            Some("stop") => Ok(Self::Stop),
            _ => Ok(Self::Continue {
                branch: output
                    .get("branch")
                    .or_else(|| output.get("handle"))
                    .and_then(|handle| match handle {
                        Value::String(text) => Some(text.clone()),
                        Value::Bool(flag) => Some(flag.to_string()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    }),
            }),
        }
    }
}

/// Executes runs against their immutable versions
pub struct Executor {
    storage: EngineStorage,
    nodes: Arc<NodeRegistry>,
    versions: Arc<VersionCache>,
    config: ExecutionConfig,
}

impl Executor {
    pub fn new(
        storage: EngineStorage,
        nodes: Arc<NodeRegistry>,
        versions: Arc<VersionCache>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            storage,
            nodes,
            versions,
            config,
        }
    }

    pub fn storage(&self) -> &EngineStorage {
        &self.storage
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    /// Execute a pending run until it completes, fails, waits or is cancelled
    ///
    /// Only a run this call atomically moves from pending to running is
    /// executed; anything else is reported as `Skipped`. Errors returned here are
    /// storage failures; run-level failures are reported as `RunOutcome::Failed`.
    pub async fn execute_run(&self, run_id: &str) -> Result<RunOutcome> {
        if !self.storage.claim_run(run_id).await? {
            tracing::debug!("⏭️ Run {} is not pending, skipping", run_id);
            return Ok(RunOutcome::Skipped);
        }

        let run = self
            .storage
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", run_id))?;
        let log = RunLogger::new(self.storage.clone(), run_id);

        tracing::info!("🚀 Executing run {} (workflow {}, version {})", run.id, run.workflow_id, run.version_id);

        match self.drive(&run, &log).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let message = e.to_string();
                self.storage.fail_run(&run.id, &message).await?;
                log.error(format!("Run failed: {}", message), Value::Null).await;
                Ok(RunOutcome::Failed { message })
            }
        }
    }

    /// Cancel a non-terminal run; an executing run stops before its next node
    pub async fn cancel_run(&self, run_id: &str) -> Result<bool> {
        let cancelled = self.storage.cancel_run(run_id).await?;
        if cancelled {
            RunLogger::new(self.storage.clone(), run_id)
                .warn("🛑 Run cancelled", Value::Null)
                .await;
        }
        Ok(cancelled)
    }

    /// Node loop for a claimed run. `Err` fails the run without a failed node:
    /// configuration problems, an exhausted budget between nodes, or storage failures.
    async fn drive(&self, run: &WorkflowRun, log: &RunLogger) -> Result<RunOutcome> {
        let version = self.versions.get_or_load(&run.version_id).await?;
        self.check_handlers(&version)?;

        let start = match run.current_node_id.as_deref() {
            Some(node_id) => node_id.to_string(),
            None => find_trigger_node(&version.nodes, run.event_type())
                .map(|node| node.id.clone())
                .ok_or_else(|| EngineError::Configuration("no trigger node found".to_string()))?,
        };

        let deadline = Instant::now() + Duration::from_millis(self.config.timeout_ms);
        let mut context = run.context.clone();
        let mut executed = run.executed_node_count;
        let mut current = start;

        loop {
            let node = version.node(&current).ok_or_else(|| {
                EngineError::Configuration(format!("node '{}' not found in version {}", current, version.id))
            })?;

            if self.storage.get_run_status(&run.id).await? == Some(RunStatus::Cancelled) {
                tracing::info!("🛑 Run {} cancelled before node {}", run.id, node.id);
                return Ok(RunOutcome::Cancelled);
            }

            // A cycle of fast nodes never trips the per-invocation timeout
            if Instant::now() >= deadline {
                tracing::warn!("⏱️ Run {} exhausted its budget before node {}", run.id, node.id);
                return Err(EngineError::Timeout(self.config.timeout_ms).into());
            }

            let config = resolve_config(&node.config, &context);
            let node_run = NodeRun::start(&run.id, node, config.clone());
            self.storage.start_node_run(&node_run).await?;

            let node_log = log.for_node(&node.id);
            node_log
                .info(format!("▶️ Executing node {} ({})", node.id, node.node_type), Value::Null)
                .await;

            let started = Instant::now();
            let remaining = deadline.saturating_duration_since(started);
            let result = tokio::time::timeout(remaining, self.invoke(node, config, &context, run, &node_log)).await;
            let elapsed_ms = started.elapsed().as_millis() as i64;

            let output = match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return self.fail_node(run, &node_run, &node_log, e.to_string(), elapsed_ms).await,
                Err(_) => {
                    let message = EngineError::Timeout(self.config.timeout_ms).to_string();
                    return self.fail_node(run, &node_run, &node_log, message, elapsed_ms).await;
                }
            };

            let outcome = match NodeOutcome::from_output(&output) {
                Ok(outcome) => outcome,
                Err(e) => return self.fail_node(run, &node_run, &node_log, e.to_string(), elapsed_ms).await,
            };

            context = add_to_context(&context, &node.id, output.clone());
            executed += 1;

            let next = match &outcome {
                NodeOutcome::Stop => None,
                NodeOutcome::Wait { next_node_id: Some(next), .. } => Some(next.clone()),
                NodeOutcome::Wait { next_node_id: None, .. } => self.next_node(&version, node, None, &node_log).await,
                NodeOutcome::Continue { branch } => self.next_node(&version, node, branch.as_deref(), &node_log).await,
            };

            if !self.storage.save_run_progress(&run.id, &context, executed, next.as_deref()).await? {
                // Only an external cancel moves a running run
                self.storage.complete_node_run(&node_run.id, &output, elapsed_ms).await?;
                tracing::info!("🛑 Run {} was cancelled while node {} executed", run.id, node.id);
                return Ok(RunOutcome::Cancelled);
            }
            self.storage.complete_node_run(&node_run.id, &output, elapsed_ms).await?;
            tracing::debug!("✅ Node {} completed in {}ms", node.id, elapsed_ms);

            match (outcome, next) {
                (NodeOutcome::Wait { resume_at, .. }, Some(next)) => {
                    let job = ScheduledJob::delay_resume(run, &next, resume_at);
                    if !self.storage.suspend_run(&run.id, &context, executed, &job).await? {
                        return Ok(RunOutcome::Cancelled);
                    }
                    node_log
                        .info(
                            format!("⏸️ Run waiting until {} to resume at {}", resume_at.to_rfc3339(), next),
                            json!({ "jobId": job.id }),
                        )
                        .await;
                    return Ok(RunOutcome::Waiting { resume_at });
                }
                (NodeOutcome::Stop, _) | (_, None) => {
                    if !self.storage.complete_run(&run.id, &context, executed).await? {
                        return Ok(RunOutcome::Cancelled);
                    }
                    log.info(
                        format!("🎉 Run completed after {} nodes", executed),
                        json!({ "executedNodeCount": executed }),
                    )
                    .await;
                    return Ok(RunOutcome::Completed);
                }
                (_, Some(next)) => current = next,
            }
        }
    }

    /// Every node type must have a handler before the first node runs
    fn check_handlers(&self, version: &WorkflowVersion) -> Result<(), EngineError> {
        let mut missing: Vec<&str> = version
            .nodes
            .iter()
            .map(|node| node.node_type.as_str())
            .filter(|node_type| !self.nodes.has_handler(node_type))
            .collect();
        missing.sort_unstable();
        missing.dedup();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Configuration(format!(
                "no handler registered for node type(s): {}",
                missing.join(", ")
            )))
        }
    }

    /// Invoke the node's handler under its retry policy
    async fn invoke(
        &self,
        node: &Node,
        config: Value,
        context: &RunContext,
        run: &WorkflowRun,
        log: &RunLogger,
    ) -> Result<Value> {
        let handler: Arc<dyn NodeHandler> = self
            .nodes
            .get_handler(&node.node_type)
            .ok_or_else(|| EngineError::Configuration(format!("no handler registered for node type: {}", node.node_type)))?;

        let policy = self.config.retry_policy(&node.node_type);
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let invocation = NodeInvocation {
                node,
                config: config.clone(),
                context,
                run,
                storage: &self.storage,
                log,
            };

            let attempt_result = AssertUnwindSafe(handler.execute(invocation))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(EngineError::Handler(panic_message(panic.as_ref())).into()));

            match attempt_result {
                Ok(output) => return Ok(output),
                Err(e) if attempt < attempts => {
                    log.warn(format!("🔁 Attempt {}/{} failed: {}", attempt, attempts, e), Value::Null)
                        .await;
                    if policy.backoff_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(policy.backoff_ms * u64::from(attempt))).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// First successor of `node`; several successors are not fanned out
    async fn next_node(
        &self,
        version: &WorkflowVersion,
        node: &Node,
        branch: Option<&str>,
        log: &RunLogger,
    ) -> Option<String> {
        let handle = if is_branching_node(node) { branch } else { None };
        let mut successors = find_next_nodes(&node.id, &version.edges, handle);

        if successors.len() > 1 {
            log.warn(
                format!("🔀 Node {} has {} successors; following only the first", node.id, successors.len()),
                json!({ "successors": successors }),
            )
            .await;
        }

        if successors.is_empty() {
            None
        } else {
            Some(successors.swap_remove(0))
        }
    }

    async fn fail_node(
        &self,
        run: &WorkflowRun,
        node_run: &NodeRun,
        log: &RunLogger,
        message: String,
        elapsed_ms: i64,
    ) -> Result<RunOutcome> {
        self.storage.fail_node_run(&node_run.id, &message, elapsed_ms).await?;
        self.storage.fail_run(&run.id, &message).await?;
        log.error(format!("Node {} failed: {}", node_run.node_id, message), Value::Null)
            .await;
        Ok(RunOutcome::Failed { message })
    }
}

/// Readable message from a handler panic payload
fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("node handler panicked: {}", detail)
}
