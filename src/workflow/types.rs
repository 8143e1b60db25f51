/// Core workflow type definitions
///
/// Defines workflows, their immutable published versions (nodes + edges), and
/// the run-time records the engine persists: runs, node runs, scheduled jobs
/// and run logs. Graph definitions are serialized as JSON for persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Run-scoped, append-only map from node id to that node's output.
///
/// The trigger ingestion layer may also place an `event_type` key here to pick
/// the matching trigger node.
pub type RunContext = Map<String, Value>;

/// Context key holding the incoming event type
pub const EVENT_TYPE_KEY: &str = "event_type";

/// Declares an enum that is stored as a lowercase string column.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                match raw {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow::anyhow!("invalid {}: {}", stringify!($name), other)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// Authoring status of a workflow
    WorkflowStatus { Draft => "draft", Active => "active" }
}

string_enum! {
    /// Run state machine: pending → running → {waiting, completed, failed};
    /// waiting → pending on resume; cancelled from any non-terminal state.
    RunStatus {
        Pending => "pending",
        Running => "running",
        Waiting => "waiting",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

string_enum! {
    /// Status of a single node execution
    NodeRunStatus { Running => "running", Completed => "completed", Failed => "failed" }
}

string_enum! {
    /// Kind of durable scheduled work
    JobType { DelayResume => "delay_resume", ScheduledTrigger => "scheduled_trigger" }
}

string_enum! {
    /// Scheduled job lifecycle: pending → processing → {processed, failed}
    JobStatus {
        Pending => "pending",
        Processing => "processing",
        Processed => "processed",
        Failed => "failed",
    }
}

string_enum! {
    /// Severity of a run log entry
    LogLevel { Debug => "debug", Info => "info", Warn => "warn", Error => "error" }
}

impl RunStatus {
    /// Completed, failed and cancelled runs never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A tenant's named automation definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: WorkflowStatus,
}

/// An immutable, published graph snapshot
///
/// Runs bind to one version forever, so editing a workflow never touches
/// in-flight runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: String,
    pub workflow_id: String,
    pub version_number: i64,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub settings: Value,
    pub is_published: bool,
    pub created_at: DateTime<Utc>,
}

impl WorkflowVersion {
    /// Look up a node by id
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == node_id)
    }
}

/// A single typed unit of work in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the version (e.g., "n1", "send-welcome")
    pub id: String,
    /// Node type string resolved through the node registry (e.g., "if_else")
    #[serde(rename = "type")]
    pub node_type: String,
    /// Node configuration; string leaves may contain `{{path}}` templates
    #[serde(default)]
    pub config: Value,
    /// Explicit entry-point marker, preferred over type-name heuristics
    #[serde(default, rename = "isTrigger", alias = "is_trigger")]
    pub is_trigger: bool,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config,
            is_trigger: false,
        }
    }
}

/// Directed connection between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    /// Named output port of the source node used for branching
    #[serde(default, rename = "sourceHandle", alias = "source_handle")]
    pub source_handle: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: None,
        }
    }

    pub fn with_handle(source: impl Into<String>, target: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: Some(handle.into()),
        }
    }
}

/// One execution instance of a version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub version_id: String,
    pub tenant_id: String,
    pub status: RunStatus,
    pub context: RunContext,
    /// Node to resume at; whole-node granularity
    pub current_node_id: Option<String>,
    /// Increments once per executed node, trigger included
    pub executed_node_count: i64,
    pub trigger_data: Value,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Build a pending run for `version`, as trigger ingestion does.
    ///
    /// `event_type` is recorded in the context so the executor can select the
    /// matching trigger node.
    pub fn new_pending(
        version: &WorkflowVersion,
        tenant_id: impl Into<String>,
        trigger_data: Value,
        event_type: Option<&str>,
    ) -> Self {
        let now = Utc::now();
        let mut context = RunContext::new();
        if let Some(event_type) = event_type {
            context.insert(EVENT_TYPE_KEY.to_string(), Value::String(event_type.to_string()));
        }

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: version.workflow_id.clone(),
            version_id: version.id.clone(),
            tenant_id: tenant_id.into(),
            status: RunStatus::Pending,
            context,
            current_node_id: None,
            executed_node_count: 0,
            trigger_data,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Event type the run was triggered by, if ingestion recorded one
    pub fn event_type(&self) -> Option<&str> {
        self.context.get(EVENT_TYPE_KEY).and_then(Value::as_str)
    }
}

/// Audit record of one node execution within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRun {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeRunStatus,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub execution_ms: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeRun {
    /// Start record for `node` with its resolved input
    pub fn start(run_id: &str, node: &Node, input_data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            status: NodeRunStatus::Running,
            input_data,
            output_data: None,
            execution_ms: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// A pending resume or scheduled trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    /// Bound run for delay resumes; `None` for scheduled triggers
    pub run_id: Option<String>,
    pub workflow_id: String,
    pub job_type: JobType,
    /// Node to resume at (delay) or the trigger node to start from (schedule)
    pub resume_node_id: Option<String>,
    pub resume_at: DateTime<Utc>,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    /// Resume `run` at `resume_node_id` once `resume_at` has passed
    pub fn delay_resume(run: &WorkflowRun, resume_node_id: &str, resume_at: DateTime<Utc>) -> Self {
        Self::pending(
            Some(run.id.clone()),
            run.workflow_id.clone(),
            JobType::DelayResume,
            Some(resume_node_id.to_string()),
            resume_at,
        )
    }

    /// Start a new run of the workflow's published version at `fire_at`
    pub fn scheduled_trigger(workflow_id: &str, trigger_node_id: Option<&str>, fire_at: DateTime<Utc>) -> Self {
        Self::pending(
            None,
            workflow_id.to_string(),
            JobType::ScheduledTrigger,
            trigger_node_id.map(str::to_string),
            fire_at,
        )
    }

    fn pending(
        run_id: Option<String>,
        workflow_id: String,
        job_type: JobType,
        resume_node_id: Option<String>,
        resume_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            workflow_id,
            job_type,
            resume_node_id,
            resume_at,
            status: JobStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }
}

/// Structured diagnostic entry attached to a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub id: String,
    pub run_id: String,
    pub node_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl RunLog {
    pub fn new(run_id: &str, node_id: Option<&str>, level: LogLevel, message: impl Into<String>, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            node_id: node_id.map(str::to_string),
            level,
            message: message.into(),
            data,
            created_at: Utc::now(),
        }
    }
}
