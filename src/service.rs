/// Engine setup and initialization
///
/// Wires together storage, the node registry, version cache, executor,
/// executor pool, job scheduler and cron triggers, and provides the
/// start/stop lifecycle used by the binary.

use crate::{
    config::Config,
    error::EngineError,
    runtime::{
        cron::CronTriggerService,
        executor::{Executor, RunOutcome},
        graph::validate_graph,
        pool::ExecutorPool,
        registry::NodeRegistry,
        scheduler::Scheduler,
    },
    workflow::{registry::VersionCache, storage::EngineStorage, types::WorkflowRun},
};
use anyhow::Result;
use serde_json::Value;
use std::{path::Path, sync::Arc};
use tokio::task::JoinHandle;

/// All engine components, shared behind Arcs
pub struct Engine {
    pub storage: EngineStorage,
    pub nodes: Arc<NodeRegistry>,
    pub versions: Arc<VersionCache>,
    pub executor: Arc<Executor>,
    pub pool: Arc<ExecutorPool>,
    pub scheduler: Arc<Scheduler>,
    pub cron: Arc<CronTriggerService>,
}

/// Connect to the configured database and build the engine with the
/// built-in node handlers
pub async fn create_engine(config: &Config) -> Result<Engine> {
    if let Some(dir) = database_dir(&config.database.url) {
        tracing::info!("📁 Ensuring database directory exists: {}", dir.display());
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("Failed to create database directory: {}", e))?;
    }

    tracing::info!("📋 Connecting engine storage: {}", config.database.url);
    let storage = EngineStorage::connect(&config.database.url, config.database.max_connections)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open engine database: {}", e))?;

    create_engine_with(storage, Arc::new(NodeRegistry::with_builtins()), config).await
}

/// Build the engine on existing storage and a caller-populated node registry
pub async fn create_engine_with(storage: EngineStorage, nodes: Arc<NodeRegistry>, config: &Config) -> Result<Engine> {
    tracing::info!("🧩 Node handlers: {}", nodes.get_node_types().join(", "));

    let versions = Arc::new(VersionCache::new(storage.clone()));

    tracing::info!("⚙️ Initializing executor (timeout {}ms)", config.execution.timeout_ms);
    let executor = Arc::new(Executor::new(
        storage.clone(),
        Arc::clone(&nodes),
        Arc::clone(&versions),
        config.execution.clone(),
    ));

    tracing::info!("🏊 Initializing executor pool (max {} concurrent runs)", config.execution.max_concurrent);
    let pool = ExecutorPool::new(Arc::clone(&executor), config.execution.max_concurrent);

    let scheduler = Scheduler::new(storage.clone(), Arc::clone(&pool), config.scheduler.clone());

    tracing::info!("⏰ Initializing cron trigger service");
    let cron = Arc::new(
        CronTriggerService::new(storage.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize cron scheduler: {}", e))?,
    );

    Ok(Engine {
        storage,
        nodes,
        versions,
        executor,
        pool,
        scheduler,
        cron,
    })
}

impl Engine {
    /// Requeue runs interrupted by a previous shutdown, then start background
    /// polling and cron firing
    pub async fn start(&self) -> Result<()> {
        self.recover_interrupted_runs().await?;
        self.scheduler.start();
        self.cron.start().await?;
        Ok(())
    }

    /// Move runs still marked running back to pending and submit them to the pool.
    ///
    /// Only safe while no executor of this database is active.
    pub async fn recover_interrupted_runs(&self) -> Result<Vec<JoinHandle<Result<RunOutcome>>>> {
        let run_ids = self.storage.requeue_interrupted_runs().await?;
        if !run_ids.is_empty() {
            tracing::warn!("♻️ Requeued {} interrupted run(s)", run_ids.len());
        }

        Ok(run_ids.into_iter().map(|run_id| self.pool.submit(run_id)).collect())
    }

    pub async fn stop(&self) -> Result<()> {
        self.scheduler.stop().await;
        self.cron.stop().await?;
        Ok(())
    }

    /// Publish a version and hot-reload its cron triggers
    pub async fn publish_version(&self, workflow_id: &str, version_id: &str) -> Result<bool> {
        if !self.storage.publish_version(workflow_id, version_id).await? {
            return Ok(false);
        }

        let version = self.versions.get_or_load(version_id).await?;
        let validation = validate_graph(&version.nodes, &version.edges);
        if !validation.valid {
            for error in &validation.errors {
                tracing::warn!("⚠️ Version {} of workflow {}: {}", version_id, workflow_id, error);
            }
        }
        self.cron.add_or_update_version(&version).await?;

        tracing::info!("📢 Published version {} of workflow {}", version_id, workflow_id);
        Ok(true)
    }

    /// Create a pending run of the workflow's published version and submit it,
    /// as trigger ingestion does for an incoming event
    pub async fn trigger(
        &self,
        workflow_id: &str,
        trigger_data: Value,
        event_type: Option<&str>,
    ) -> Result<(String, JoinHandle<Result<RunOutcome>>)> {
        let workflow = self
            .storage
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow", workflow_id))?;
        let version = self
            .storage
            .get_published_version(workflow_id)
            .await?
            .ok_or_else(|| EngineError::not_found("published version for workflow", workflow_id))?;

        let run = WorkflowRun::new_pending(&version, workflow.tenant_id, trigger_data, event_type);
        self.storage.create_run(&run).await?;

        tracing::info!("📨 Triggered run {} of workflow {}", run.id, workflow_id);
        let handle = self.pool.submit(run.id.clone());
        Ok((run.id, handle))
    }
}

/// Start the engine and run until Ctrl-C
pub async fn start_service(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Flowrunner engine...");

    let engine = create_engine(&config).await?;
    engine.start().await?;

    tracing::info!("✅ Flowrunner engine running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("⏹️ Shutting down Flowrunner engine");
    engine.stop().await?;

    Ok(())
}

/// Parent directory of a file-backed SQLite URL
fn database_dir(url: &str) -> Option<&Path> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?
        .split('?')
        .next()?;

    if path.is_empty() || path.contains(":memory:") {
        return None;
    }

    Path::new(path).parent().filter(|dir| !dir.as_os_str().is_empty())
}
