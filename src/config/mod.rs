/// Configuration management for the Flowrunner engine
///
/// Handles the storage location, per-run execution limits, pool sizing and
/// scheduler cadence. Every knob can be supplied through the environment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Run execution limits
    pub execution: ExecutionConfig,
    /// Delayed-resume and scheduled-trigger polling
    pub scheduler: SchedulerConfig,
}

/// Database configuration for run/job persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL (e.g., "sqlite://data/flowrunner.db")
    pub url: String,
    /// Maximum pooled connections
    pub max_connections: u32,
}

/// Execution limits applied by the executor and its pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Wall-clock budget for one execution pass of a run, in milliseconds
    pub timeout_ms: u64,
    /// Maximum runs executing concurrently in this process
    pub max_concurrent: usize,
    /// Retry policy per node type. Node types without an entry are attempted once.
    #[serde(default)]
    pub retry_policies: HashMap<String, RetryPolicy>,
}

/// Handler retry policy for a single node type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1, backoff_ms: 0 }
    }
}

/// Scheduler polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between polls for due jobs, in milliseconds
    pub poll_interval_ms: u64,
    /// Maximum jobs claimed per poll
    pub batch_size: u32,
}

impl ExecutionConfig {
    /// Retry policy that applies to `node_type`
    pub fn retry_policy(&self, node_type: &str) -> RetryPolicy {
        self.retry_policies.get(node_type).copied().unwrap_or_default()
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: env_or("FLOWRUNNER_EXECUTION_TIMEOUT_MS", 300_000),
            max_concurrent: env_or("FLOWRUNNER_MAX_CONCURRENT_RUNS", 10),
            retry_policies: HashMap::new(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: env_or("FLOWRUNNER_SCHEDULER_POLL_MS", 5_000),
            batch_size: env_or("FLOWRUNNER_SCHEDULER_BATCH_SIZE", 50),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("FLOWRUNNER_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/flowrunner.db".to_string()),
            max_connections: env_or("FLOWRUNNER_DATABASE_MAX_CONNECTIONS", 5),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            execution: ExecutionConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}
