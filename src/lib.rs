/// Flowrunner: workflow execution engine
///
/// Executes tenant-defined automation graphs once per triggering event,
/// producing observable, resumable and auditable runs.

// Core configuration and setup
pub mod config;

// Typed error classes
pub mod error;

// Workflow management layer - definitions, storage and version cache
pub mod workflow;

// Runtime execution engine - resolver, traversal, executor, pool and scheduler
pub mod runtime;

// Engine setup and lifecycle
pub mod service;

// Re-export commonly used types for external consumers
pub use error::{EngineError, ExpressionError, GraphError};
pub use runtime::{Executor, ExecutorPool, NodeHandler, NodeInvocation, NodeRegistry, RunOutcome, Scheduler};
pub use service::{create_engine, create_engine_with, start_service, Engine};
pub use workflow::{Edge, Node, Workflow, WorkflowRun, WorkflowVersion};
