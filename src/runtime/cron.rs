/// Cron recurrence for scheduled trigger nodes
///
/// Uses tokio-cron-scheduler to fire on each `schedule_trigger` / `cron_trigger`
/// node's `schedule` (6-field cron: sec min hour day month weekday). A firing
/// does not execute anything itself: it records a durable `scheduled_trigger`
/// job that the polling `Scheduler` turns into a run. Fire times are truncated
/// to the second and deduplicated in storage, so several engine processes
/// firing the same schedule produce one run.

use crate::workflow::{
    storage::EngineStorage,
    types::{Node, ScheduledJob, WorkflowVersion},
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, SubsecRound, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Node types whose `schedule` config is registered with the cron scheduler
pub const CRON_NODE_TYPES: [&str; 2] = ["schedule_trigger", "cron_trigger"];

/// Hot-reloadable cron registrations, one per trigger node
pub struct CronTriggerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    /// "workflow_id:node_id" → scheduler job UUID, needed for removal
    job_uuid_map: Arc<RwLock<HashMap<String, Uuid>>>,
    storage: EngineStorage,
}

impl CronTriggerService {
    pub async fn new(storage: EngineStorage) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid_map: Arc::new(RwLock::new(HashMap::new())),
            storage,
        })
    }

    /// Register triggers of every published version and start firing
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting cron trigger service");

        let versions = self.storage.list_published_versions().await?;
        let mut total = 0;
        for version in &versions {
            total += self.add_or_update_version(version).await?;
        }

        self.scheduler.read().await.start().await?;

        tracing::info!("📊 Registered {} cron triggers from {} published versions", total, versions.len());
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron trigger service");

        self.job_uuid_map.write().await.clear();
        self.scheduler.write().await.shutdown().await?;

        tracing::info!("✅ Cron trigger service stopped");
        Ok(())
    }

    /// Replace a workflow's registrations with the triggers of `version`
    ///
    /// Called when a new version is published. Returns the number of triggers registered.
    pub async fn add_or_update_version(&self, version: &WorkflowVersion) -> Result<usize> {
        self.remove_workflow(&version.workflow_id).await;

        let cron_nodes: Vec<&Node> = version.nodes.iter().filter(|node| is_cron_trigger(node)).collect();
        for node in &cron_nodes {
            self.add_cron_job(&version.workflow_id, node).await?;
        }

        if !cron_nodes.is_empty() {
            tracing::info!("🔥 Registered {} cron triggers for workflow: {}", cron_nodes.len(), version.workflow_id);
        }
        Ok(cron_nodes.len())
    }

    /// Remove every registration of a workflow
    pub async fn remove_workflow(&self, workflow_id: &str) {
        let prefix = format!("{}:", workflow_id);
        let mut job_uuid_map = self.job_uuid_map.write().await;
        let keys: Vec<String> = job_uuid_map.keys().filter(|key| key.starts_with(&prefix)).cloned().collect();

        for key in keys {
            if let Some(job_uuid) = job_uuid_map.remove(&key) {
                let scheduler = self.scheduler.read().await;
                if let Err(e) = scheduler.remove(&job_uuid).await {
                    tracing::warn!("⚠️ Failed to remove cron job {}: {}", key, e);
                } else {
                    tracing::debug!("🛑 Removed cron job: {}", key);
                }
            }
        }
    }

    /// Registered "workflow_id:node_id" keys, sorted
    pub async fn registered(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.job_uuid_map.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn add_cron_job(&self, workflow_id: &str, node: &Node) -> Result<()> {
        let schedule = schedule_of(node).ok_or_else(|| anyhow!("cron trigger '{}' has no schedule", node.id))?;
        let key = format!("{}:{}", workflow_id, node.id);

        let workflow_id = workflow_id.to_string();
        let node_id = node.id.clone();
        let storage = self.storage.clone();

        let job = Job::new_async(schedule, move |_uuid, _l| {
            let workflow_id = workflow_id.clone();
            let node_id = node_id.clone();
            let storage = storage.clone();

            Box::pin(async move {
                tracing::debug!("🔔 Cron trigger fired: {} in workflow {}", node_id, workflow_id);
                match record_fire(&storage, &workflow_id, &node_id, Utc::now()).await {
                    Ok(true) => tracing::info!("📅 Scheduled trigger queued for workflow {}", workflow_id),
                    Ok(false) => tracing::debug!("⏭️ Trigger for workflow {} already queued", workflow_id),
                    Err(e) => tracing::error!("❌ Failed to queue scheduled trigger for {}: {}", workflow_id, e),
                }
            })
        })?;

        let job_uuid = self.scheduler.read().await.add(job).await?;
        self.job_uuid_map.write().await.insert(key.clone(), job_uuid);

        tracing::debug!("⏰ Cron job registered: {} ({})", key, schedule);
        Ok(())
    }
}

/// Record one firing as a `scheduled_trigger` job
///
/// Returns false if the same workflow/node/second was already recorded.
pub async fn record_fire(storage: &EngineStorage, workflow_id: &str, node_id: &str, at: DateTime<Utc>) -> Result<bool> {
    let job = ScheduledJob::scheduled_trigger(workflow_id, Some(node_id), at.trunc_subsecs(0));
    storage.insert_job(&job).await
}

pub fn is_cron_trigger(node: &Node) -> bool {
    CRON_NODE_TYPES.contains(&node.node_type.as_str()) && schedule_of(node).is_some()
}

fn schedule_of(node: &Node) -> Option<&str> {
    node.config
        .get("schedule")
        .or_else(|| node.config.get("cron"))
        .and_then(|schedule| schedule.as_str())
        .filter(|schedule| !schedule.trim().is_empty())
}
