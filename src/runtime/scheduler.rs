/// Durable job scheduler
///
/// Polls `workflow_scheduled_jobs` for due work. Each tick atomically claims a
/// bounded batch (pending → processing), then:
/// - `delay_resume`: moves the waiting run back to pending at its resume node
///   and resubmits it to the executor pool
/// - `scheduled_trigger`: creates a fresh run of the workflow's published
///   version and submits it
///
/// Jobs end `processed` or `failed` with the captured error. Failed jobs are
/// not retried.

use crate::{
    config::SchedulerConfig,
    error::EngineError,
    runtime::{executor::RunOutcome, pool::ExecutorPool},
    workflow::{
        storage::EngineStorage,
        types::{JobType, ScheduledJob, WorkflowRun},
    },
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::json;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle};

/// What one polling tick did
#[derive(Debug, Default)]
pub struct TickReport {
    pub claimed: usize,
    pub processed: usize,
    pub failed: usize,
    /// Runs handed to the pool during this tick
    pub submitted: Vec<JoinHandle<Result<RunOutcome>>>,
}

pub struct Scheduler {
    storage: EngineStorage,
    pool: Arc<ExecutorPool>,
    config: SchedulerConfig,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(storage: EngineStorage, pool: Arc<ExecutorPool>, config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            storage,
            pool,
            config,
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// Start the background polling loop (no-op if already running)
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let scheduler = Arc::clone(self);
        let period = Duration::from_millis(self.config.poll_interval_ms.max(1));

        tracing::info!("⏰ Starting job scheduler (poll every {:?}, batch {})", period, self.config.batch_size);

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match scheduler.tick().await {
                            Ok(report) if report.claimed > 0 => tracing::info!(
                                "📊 Scheduler tick: {} claimed, {} processed, {} failed",
                                report.claimed, report.processed, report.failed
                            ),
                            Ok(_) => {}
                            Err(e) => tracing::error!("❌ Scheduler tick failed: {}", e),
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        }));
        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);
    }

    /// Stop the polling loop and wait for the current tick to finish
    pub async fn stop(&self) {
        let shutdown = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).take();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("⚠️ Scheduler task ended abnormally: {}", e);
            }
        }

        tracing::info!("✅ Job scheduler stopped");
    }

    /// Claim and process one batch of due jobs
    pub async fn tick(&self) -> Result<TickReport> {
        let jobs = self.storage.claim_due_jobs(Utc::now(), self.config.batch_size).await?;
        let mut report = TickReport {
            claimed: jobs.len(),
            ..TickReport::default()
        };

        // A storage error on one job must not strand the rest of the claimed batch
        for job in jobs {
            match self.finish(&job).await {
                Ok(Some(handle)) => {
                    report.processed += 1;
                    report.submitted.push(handle);
                }
                Ok(None) => report.failed += 1,
                Err(e) => {
                    tracing::error!("❌ Could not record outcome of scheduled job {}: {}", job.id, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Resume a waiting run now, ahead of its scheduled time
    ///
    /// Goes through the same atomic claim as polling, so a manual resume and
    /// the scheduler can never both resume the run. Returns `None` when the run
    /// has no pending delay job.
    pub async fn resume_now(&self, run_id: &str) -> Result<Option<JoinHandle<Result<RunOutcome>>>> {
        match self.storage.claim_delay_job(run_id).await? {
            Some(job) => {
                tracing::info!("⏩ Manual resume of run {}", run_id);
                self.finish(&job).await
            }
            None => Ok(None),
        }
    }

    /// Process a claimed job and record its final status
    async fn finish(&self, job: &ScheduledJob) -> Result<Option<JoinHandle<Result<RunOutcome>>>> {
        match self.process(job).await {
            Ok(handle) => {
                self.storage.mark_job_processed(&job.id).await?;
                Ok(Some(handle))
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!("❌ Scheduled job {} ({}) failed: {}", job.id, job.job_type, message);
                self.storage.mark_job_failed(&job.id, &message).await?;
                Ok(None)
            }
        }
    }

    async fn process(&self, job: &ScheduledJob) -> Result<JoinHandle<Result<RunOutcome>>> {
        match job.job_type {
            JobType::DelayResume => {
                let run_id = job
                    .run_id
                    .as_deref()
                    .ok_or_else(|| anyhow!("delay_resume job {} has no run", job.id))?;
                let node_id = job
                    .resume_node_id
                    .as_deref()
                    .ok_or_else(|| anyhow!("delay_resume job {} has no resume node", job.id))?;

                if !self.storage.requeue_waiting_run(run_id, node_id).await? {
                    return Err(anyhow!("run {} is not waiting", run_id));
                }

                tracing::debug!("🔔 Resuming run {} at node {}", run_id, node_id);
                Ok(self.pool.submit(run_id))
            }
            JobType::ScheduledTrigger => {
                let workflow = self
                    .storage
                    .get_workflow(&job.workflow_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("workflow", job.workflow_id.as_str()))?;
                let version = self
                    .storage
                    .get_published_version(&job.workflow_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("published version for workflow", job.workflow_id.as_str()))?;

                let trigger = job.resume_node_id.as_deref().and_then(|id| version.node(id));
                let trigger_data = json!({
                    "scheduledAt": job.resume_at.to_rfc3339(),
                    "jobId": job.id,
                });

                let mut run = WorkflowRun::new_pending(
                    &version,
                    workflow.tenant_id,
                    trigger_data,
                    trigger.map(|node| node.node_type.as_str()),
                );
                run.current_node_id = trigger.map(|node| node.id.clone());
                self.storage.create_run(&run).await?;

                tracing::info!("🚀 Scheduled trigger created run {} for workflow {}", run.id, workflow.id);
                Ok(self.pool.submit(run.id))
            }
        }
    }
}
