/// Runtime Execution Engine
///
/// This module drives runs through their workflow graphs. It handles:
/// - Template and expression resolution against the run context
/// - Trigger discovery, successor selection and graph validation
/// - Node handler lookup and the built-in control-flow nodes
/// - The per-run state machine, the bounded executor pool and job scheduling

// `{{path}}` template resolution against accumulated node outputs
pub mod context;

// Sandboxed expression parser and evaluator for conditional nodes
pub mod expression;

// Trigger lookup, successor selection, topological order and validation
pub mod graph;

// Node type → handler lookup and the handler contract
pub mod registry;

// Built-in control-flow handlers (triggers, if_else, switch, delay, ...)
pub mod nodes;

// Run state machine
pub mod executor;

// Bounded-concurrency admission for run execution
pub mod pool;

// Polling scheduler for delayed resumes and scheduled triggers
pub mod scheduler;

// Cron recurrence that records scheduled trigger jobs
pub mod cron;

// Re-export main types
pub use executor::{Executor, NodeOutcome, RunOutcome};
pub use pool::{ExecutorPool, PoolStatus};
pub use registry::{NodeHandler, NodeInvocation, NodeRegistry, RunLogger};
pub use scheduler::{Scheduler, TickReport};
