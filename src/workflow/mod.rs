/// Workflow Management Layer
///
/// This module handles workflow definitions, persistence, and the version cache.
/// It provides:
/// - Type definitions (Workflow, WorkflowVersion, Node, Edge, runs and jobs)
/// - SQLite persistence with sqlx
/// - Lock-free cache of immutable versions using ArcSwap

// Core workflow type definitions
pub mod types;

// SQLite persistence layer for workflows, runs and scheduled jobs
pub mod storage;

// Immutable version cache using ArcSwap
pub mod registry;

// Re-export commonly used types
pub use types::{Edge, Node, NodeRun, RunContext, RunStatus, ScheduledJob, Workflow, WorkflowRun, WorkflowVersion};
