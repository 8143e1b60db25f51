/// Node handler registry
///
/// Maps node type strings to handler implementations. Handlers are supplied
/// from outside the engine (email, chat, AI, CRM integrations) plus the
/// built-in control-flow set in `runtime::nodes`. The map lives behind ArcSwap
/// so handlers can be registered while runs are executing.

use crate::workflow::{
    storage::EngineStorage,
    types::{LogLevel, Node, RunContext, RunLog, WorkflowRun},
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};

/// Everything a handler gets to see for one node execution
pub struct NodeInvocation<'a> {
    /// Node definition as stored in the version (unresolved config)
    pub node: &'a Node,
    /// Node config with every `{{path}}` template resolved against the context
    pub config: Value,
    pub context: &'a RunContext,
    pub run: &'a WorkflowRun,
    pub storage: &'a EngineStorage,
    pub log: &'a RunLogger,
}

impl NodeInvocation<'_> {
    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    /// Configuration exactly as authored, before template resolution
    pub fn raw_config(&self) -> &Value {
        &self.node.config
    }
}

/// Contract every node type implements
///
/// The returned JSON becomes `context[node_id]`. Branching handlers set
/// `branch` (or `handle`); delays return `{"action": "wait", "resumeAt", "nextNodeId"}`;
/// terminal nodes return `{"action": "stop"}`. Returning `Err` fails the node
/// and the run with the error's message.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, invocation: NodeInvocation<'_>) -> anyhow::Result<Value>;
}

/// Writes structured `RunLog` rows for a run and mirrors them to tracing
#[derive(Clone)]
pub struct RunLogger {
    storage: EngineStorage,
    run_id: String,
    node_id: Option<String>,
}

impl RunLogger {
    pub fn new(storage: EngineStorage, run_id: impl Into<String>) -> Self {
        Self {
            storage,
            run_id: run_id.into(),
            node_id: None,
        }
    }

    /// Logger whose entries are attributed to `node_id`
    pub fn for_node(&self, node_id: &str) -> Self {
        Self {
            storage: self.storage.clone(),
            run_id: self.run_id.clone(),
            node_id: Some(node_id.to_string()),
        }
    }

    /// Append a log entry; a failed write is reported but never fails the run
    pub async fn log(&self, level: LogLevel, message: impl Into<String>, data: Value) {
        let entry = RunLog::new(&self.run_id, self.node_id.as_deref(), level, message, data);
        let node = entry.node_id.as_deref().unwrap_or("-");

        match level {
            LogLevel::Debug => tracing::debug!("📝 [{}/{}] {}", entry.run_id, node, entry.message),
            LogLevel::Info => tracing::info!("📝 [{}/{}] {}", entry.run_id, node, entry.message),
            LogLevel::Warn => tracing::warn!("⚠️ [{}/{}] {}", entry.run_id, node, entry.message),
            LogLevel::Error => tracing::error!("❌ [{}/{}] {}", entry.run_id, node, entry.message),
        }

        if let Err(e) = self.storage.append_log(&entry).await {
            tracing::warn!("⚠️ Failed to persist run log for {}: {}", self.run_id, e);
        }
    }

    pub async fn info(&self, message: impl Into<String>, data: Value) {
        self.log(LogLevel::Info, message, data).await
    }

    pub async fn warn(&self, message: impl Into<String>, data: Value) {
        self.log(LogLevel::Warn, message, data).await
    }

    pub async fn error(&self, message: impl Into<String>, data: Value) {
        self.log(LogLevel::Error, message, data).await
    }
}

/// Lock-free node type → handler lookup
pub struct NodeRegistry {
    handlers: ArcSwap<HashMap<String, Arc<dyn NodeHandler>>>,
}

impl NodeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            handlers: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Registry pre-loaded with the built-in control-flow handlers
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::runtime::nodes::register_builtins(&registry);
        registry
    }

    /// Register (or replace) the handler for `node_type`
    pub fn register(&self, node_type: impl Into<String>, handler: impl NodeHandler + 'static) {
        self.register_arc(node_type, Arc::new(handler));
    }

    /// Register a shared handler instance, e.g. one handler for several types
    pub fn register_arc(&self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        let node_type = node_type.into();
        self.handlers.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(node_type.clone(), Arc::clone(&handler));
            next
        });
        tracing::debug!("🧩 Registered node handler: {}", node_type);
    }

    pub fn get_handler(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.load().get(node_type).cloned()
    }

    pub fn has_handler(&self, node_type: &str) -> bool {
        self.handlers.load().contains_key(node_type)
    }

    /// Registered node types, sorted
    pub fn get_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.load().keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("node_types", &self.get_node_types())
            .finish()
    }
}
