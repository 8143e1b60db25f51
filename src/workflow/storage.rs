/// SQLite persistence layer for workflows, runs and scheduled jobs
///
/// Graph definitions, run contexts and node payloads are stored as JSON text;
/// timestamps are stored as epoch milliseconds so due-job comparisons are exact.
/// Every state transition is a single guarded UPDATE so that concurrent
/// engine processes cannot both win the same transition.

use crate::workflow::types::{
    JobStatus, NodeRun, RunContext, RunLog, RunStatus, ScheduledJob, Workflow, WorkflowRun,
    WorkflowVersion,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::{str::FromStr, time::Duration};

const RUN_COLUMNS: &str = "id, workflow_id, version_id, tenant_id, status, context, current_node_id, \
     executed_node_count, trigger_data, error_message, created_at, started_at, completed_at, updated_at";

const JOB_COLUMNS: &str = "id, run_id, workflow_id, job_type, resume_node_id, resume_at, status, \
     error_message, created_at, processed_at";

const NODE_RUN_COLUMNS: &str = "id, run_id, node_id, node_type, status, input_data, output_data, \
     execution_ms, error_message, started_at, completed_at";

const VERSION_COLUMNS: &str = "id, workflow_id, version_number, nodes, edges, settings, is_published, created_at";

/// SQLite-backed storage shared by the executor, pool and scheduler
#[derive(Debug, Clone)]
pub struct EngineStorage {
    /// SQLite connection pool for the engine database
    pool: SqlitePool,
}

impl EngineStorage {
    /// Create new storage instance with an existing connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Connect to `url`, creating the database file if needed, and initialize the schema
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let storage = Self::new(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open a private in-memory database (for testing)
    ///
    /// A single connection is kept alive forever because every SQLite memory
    /// connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let storage = Self::new(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Initialize the engine schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_versions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                version_number INTEGER NOT NULL,
                nodes TEXT NOT NULL,
                edges TEXT NOT NULL,
                settings TEXT NOT NULL,
                is_published INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_runs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                version_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                context TEXT NOT NULL,
                current_node_id TEXT,
                executed_node_count INTEGER NOT NULL DEFAULT 0,
                trigger_data TEXT NOT NULL,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_run_nodes (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                status TEXT NOT NULL,
                input_data TEXT NOT NULL,
                output_data TEXT,
                execution_ms INTEGER,
                error_message TEXT,
                started_at INTEGER NOT NULL,
                completed_at INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_run_logs (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_scheduled_jobs (
                id TEXT PRIMARY KEY,
                run_id TEXT,
                workflow_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                resume_node_id TEXT,
                resume_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                processed_at INTEGER
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_versions_workflow ON workflow_versions(workflow_id, is_published)",
            "CREATE INDEX IF NOT EXISTS idx_runs_status ON workflow_runs(status)",
            "CREATE INDEX IF NOT EXISTS idx_run_nodes_run ON workflow_run_nodes(run_id)",
            "CREATE INDEX IF NOT EXISTS idx_run_logs_run ON workflow_run_logs(run_id)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_due ON workflow_scheduled_jobs(status, resume_at)",
            // One scheduled trigger per workflow per fire time, whichever process inserts first
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_trigger_once
            ON workflow_scheduled_jobs(workflow_id, resume_node_id, resume_at)
            WHERE job_type = 'scheduled_trigger'
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    // ---------------------------------------------------------------------
    // Workflows and versions
    // ---------------------------------------------------------------------

    /// Store a new workflow or update an existing one
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO workflows (id, tenant_id, name, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.tenant_id)
        .bind(&workflow.name)
        .bind(workflow.status.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieve a workflow by ID
    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT id, tenant_id, name, status FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Workflow {
                id: row.try_get("id")?,
                tenant_id: row.try_get("tenant_id")?,
                name: row.try_get("name")?,
                status: row.try_get::<String, _>("status")?.parse()?,
            })),
            None => Ok(None),
        }
    }

    /// Insert a version snapshot. Versions are never updated afterwards.
    pub async fn save_version(&self, version: &WorkflowVersion) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_versions
                (id, workflow_id, version_number, nodes, edges, settings, is_published, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&version.id)
        .bind(&version.workflow_id)
        .bind(version.version_number)
        .bind(serde_json::to_string(&version.nodes)?)
        .bind(serde_json::to_string(&version.edges)?)
        .bind(serde_json::to_string(&version.settings)?)
        .bind(version.is_published)
        .bind(version.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Make `version_id` the only published version of its workflow
    pub async fn publish_version(&self, workflow_id: &str, version_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE workflow_versions SET is_published = 0 WHERE workflow_id = ?")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("UPDATE workflow_versions SET is_published = 1 WHERE id = ? AND workflow_id = ?")
            .bind(version_id)
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Retrieve a version by ID
    pub async fn get_version(&self, id: &str) -> Result<Option<WorkflowVersion>> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|row| version_from_row(&row)).transpose()
    }

    /// Currently published version of a workflow
    pub async fn get_published_version(&self, workflow_id: &str) -> Result<Option<WorkflowVersion>> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions \
             WHERE workflow_id = ? AND is_published = 1 \
             ORDER BY version_number DESC LIMIT 1"
        );
        let row = sqlx::query(&sql).bind(workflow_id).fetch_optional(&self.pool).await?;
        row.map(|row| version_from_row(&row)).transpose()
    }

    /// All published versions (used to register cron triggers at startup)
    pub async fn list_published_versions(&self) -> Result<Vec<WorkflowVersion>> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE is_published = 1");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(version_from_row).collect()
    }

    // ---------------------------------------------------------------------
    // Runs
    // ---------------------------------------------------------------------

    /// Insert a freshly created run
    pub async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow_id, version_id, tenant_id, status, context, current_node_id,
                 executed_node_count, trigger_data, error_message, created_at, started_at,
                 completed_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.workflow_id)
        .bind(&run.version_id)
        .bind(&run.tenant_id)
        .bind(run.status.as_str())
        .bind(serde_json::to_string(&run.context)?)
        .bind(&run.current_node_id)
        .bind(run.executed_node_count)
        .bind(serde_json::to_string(&run.trigger_data)?)
        .bind(&run.error_message)
        .bind(run.created_at.timestamp_millis())
        .bind(run.started_at.map(|at| at.timestamp_millis()))
        .bind(run.completed_at.map(|at| at.timestamp_millis()))
        .bind(run.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieve a run by ID
    pub async fn get_run(&self, id: &str) -> Result<Option<WorkflowRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|row| run_from_row(&row)).transpose()
    }

    /// Current status of a run without loading its context
    pub async fn get_run_status(&self, id: &str) -> Result<Option<RunStatus>> {
        let row = sqlx::query("SELECT status FROM workflow_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>("status")?.parse()?)),
            None => Ok(None),
        }
    }

    /// Atomically move a run from pending to running.
    ///
    /// Returns false when another worker already claimed it or the run is not pending.
    pub async fn claim_run(&self, id: &str) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'running', started_at = COALESCE(started_at, ?), updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Persist context and progress after a completed node
    pub async fn save_run_progress(
        &self,
        id: &str,
        context: &RunContext,
        executed_node_count: i64,
        current_node_id: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET context = ?, executed_node_count = ?, current_node_id = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(serde_json::to_string(context)?)
        .bind(executed_node_count)
        .bind(current_node_id)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark a running run completed with its final context
    pub async fn complete_run(&self, id: &str, context: &RunContext, executed_node_count: i64) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'completed', context = ?, executed_node_count = ?, current_node_id = NULL,
                completed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(serde_json::to_string(context)?)
        .bind(executed_node_count)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark a non-terminal run failed
    pub async fn fail_run(&self, id: &str, error_message: &str) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'failed', error_message = ?, completed_at = ?, updated_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(error_message)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancel a non-terminal run and fail its pending delay jobs in one transaction
    pub async fn cancel_run(&self, id: &str) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'cancelled', completed_at = ?, updated_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        // A cancelled run must never be resumed by a pending delay job
        sqlx::query(
            r#"
            UPDATE workflow_scheduled_jobs
            SET status = 'failed', error_message = 'run cancelled', processed_at = ?
            WHERE run_id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Move runs left `running` by a stopped process back to pending.
    ///
    /// `current_node_id` is kept, so a requeued run re-executes the node it was
    /// in and continues from there. Node runs that never finished are failed.
    /// Returns the ids of the requeued runs.
    pub async fn requeue_interrupted_runs(&self) -> Result<Vec<String>> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE workflow_run_nodes
            SET status = 'failed', error_message = 'execution interrupted', completed_at = ?
            WHERE status = 'running'
              AND run_id IN (SELECT id FROM workflow_runs WHERE status = 'running')
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let run_ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE workflow_runs
            SET status = 'pending', updated_at = ?
            WHERE status = 'running'
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(run_ids)
    }

    /// Suspend a running run on a delay: insert the resume job and flip the
    /// run to waiting in one transaction.
    pub async fn suspend_run(
        &self,
        id: &str,
        context: &RunContext,
        executed_node_count: i64,
        job: &ScheduledJob,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'waiting', context = ?, executed_node_count = ?, current_node_id = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(serde_json::to_string(context)?)
        .bind(executed_node_count)
        .bind(&job.resume_node_id)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_job_with(&mut *tx, job).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Move a waiting run back to pending at `resume_node_id`
    pub async fn requeue_waiting_run(&self, id: &str, resume_node_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'pending', current_node_id = ?, updated_at = ?
            WHERE id = ? AND status = 'waiting'
            "#,
        )
        .bind(resume_node_id)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ---------------------------------------------------------------------
    // Node runs and logs
    // ---------------------------------------------------------------------

    /// Record a node execution as running
    pub async fn start_node_run(&self, node_run: &NodeRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_run_nodes
                (id, run_id, node_id, node_type, status, input_data, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node_run.id)
        .bind(&node_run.run_id)
        .bind(&node_run.node_id)
        .bind(&node_run.node_type)
        .bind(node_run.status.as_str())
        .bind(serde_json::to_string(&node_run.input_data)?)
        .bind(node_run.started_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Finalize a node execution as completed
    pub async fn complete_node_run(&self, id: &str, output: &Value, execution_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_run_nodes
            SET status = 'completed', output_data = ?, execution_ms = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(serde_json::to_string(output)?)
        .bind(execution_ms)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Finalize a node execution as failed
    pub async fn fail_node_run(&self, id: &str, error_message: &str, execution_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_run_nodes
            SET status = 'failed', error_message = ?, execution_ms = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error_message)
        .bind(execution_ms)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Node executions of a run in execution order
    pub async fn list_node_runs(&self, run_id: &str) -> Result<Vec<NodeRun>> {
        let sql = format!("SELECT {NODE_RUN_COLUMNS} FROM workflow_run_nodes WHERE run_id = ? ORDER BY rowid");
        let rows = sqlx::query(&sql).bind(run_id).fetch_all(&self.pool).await?;
        rows.iter().map(node_run_from_row).collect()
    }

    /// Append a structured log entry
    pub async fn append_log(&self, log: &RunLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_run_logs (id, run_id, node_id, level, message, data, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(&log.run_id)
        .bind(&log.node_id)
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(serde_json::to_string(&log.data)?)
        .bind(log.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Log entries of a run in insertion order
    pub async fn list_logs(&self, run_id: &str) -> Result<Vec<RunLog>> {
        let rows = sqlx::query(
            "SELECT id, run_id, node_id, level, message, data, created_at \
             FROM workflow_run_logs WHERE run_id = ? ORDER BY rowid",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut logs = Vec::with_capacity(rows.len());
        for row in rows {
            logs.push(RunLog {
                id: row.try_get("id")?,
                run_id: row.try_get("run_id")?,
                node_id: row.try_get("node_id")?,
                level: row.try_get::<String, _>("level")?.parse()?,
                message: row.try_get("message")?,
                data: serde_json::from_str(&row.try_get::<String, _>("data")?)?,
                created_at: from_millis(row.try_get("created_at")?),
            });
        }

        Ok(logs)
    }

    // ---------------------------------------------------------------------
    // Scheduled jobs
    // ---------------------------------------------------------------------

    /// Insert a job. Returns false when an identical scheduled trigger already exists.
    pub async fn insert_job(&self, job: &ScheduledJob) -> Result<bool> {
        Ok(insert_job_with(&self.pool, job).await? == 1)
    }

    /// Atomically claim up to `limit` due jobs, flipping them to processing.
    ///
    /// The whole select-and-update is one statement, so two pollers racing on
    /// the same table never both receive the same job.
    pub async fn claim_due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduledJob>> {
        let sql = format!(
            r#"
            UPDATE workflow_scheduled_jobs
            SET status = 'processing'
            WHERE status = 'pending'
              AND id IN (
                  SELECT id FROM workflow_scheduled_jobs
                  WHERE status = 'pending' AND resume_at <= ?
                  ORDER BY resume_at
                  LIMIT ?
              )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(now.timestamp_millis())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        jobs.sort_by_key(|job| job.resume_at);
        Ok(jobs)
    }

    /// Claim the pending delay job of one run regardless of its due time
    pub async fn claim_delay_job(&self, run_id: &str) -> Result<Option<ScheduledJob>> {
        let sql = format!(
            r#"
            UPDATE workflow_scheduled_jobs
            SET status = 'processing'
            WHERE status = 'pending'
              AND id = (
                  SELECT id FROM workflow_scheduled_jobs
                  WHERE run_id = ? AND job_type = 'delay_resume' AND status = 'pending'
                  ORDER BY resume_at
                  LIMIT 1
              )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql).bind(run_id).fetch_optional(&self.pool).await?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    /// Mark a processing job processed
    pub async fn mark_job_processed(&self, id: &str) -> Result<()> {
        self.finish_job(id, JobStatus::Processed, None).await
    }

    /// Mark a processing job failed with the captured error
    pub async fn mark_job_failed(&self, id: &str, error_message: &str) -> Result<()> {
        self.finish_job(id, JobStatus::Failed, Some(error_message)).await
    }

    async fn finish_job(&self, id: &str, status: JobStatus, error_message: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_scheduled_jobs
            SET status = ?, error_message = ?, processed_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieve a job by ID
    pub async fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM workflow_scheduled_jobs WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    /// Jobs bound to a run, oldest first
    pub async fn list_jobs_for_run(&self, run_id: &str) -> Result<Vec<ScheduledJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM workflow_scheduled_jobs WHERE run_id = ? ORDER BY created_at, rowid");
        let rows = sqlx::query(&sql).bind(run_id).fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Jobs of a workflow, oldest first
    pub async fn list_jobs_for_workflow(&self, workflow_id: &str) -> Result<Vec<ScheduledJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM workflow_scheduled_jobs WHERE workflow_id = ? ORDER BY created_at, rowid");
        let rows = sqlx::query(&sql).bind(workflow_id).fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Runs of a workflow, oldest first
    pub async fn list_runs_for_workflow(&self, workflow_id: &str) -> Result<Vec<WorkflowRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow_id = ? ORDER BY created_at, rowid");
        let rows = sqlx::query(&sql).bind(workflow_id).fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }
}

async fn insert_job_with<'e, E>(executor: E, job: &ScheduledJob) -> Result<u64>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO workflow_scheduled_jobs
            (id, run_id, workflow_id, job_type, resume_node_id, resume_at, status, error_message,
             created_at, processed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&job.id)
    .bind(&job.run_id)
    .bind(&job.workflow_id)
    .bind(job.job_type.as_str())
    .bind(&job.resume_node_id)
    .bind(job.resume_at.timestamp_millis())
    .bind(job.status.as_str())
    .bind(&job.error_message)
    .bind(job.created_at.timestamp_millis())
    .bind(job.processed_at.map(|at| at.timestamp_millis()))
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn optional_millis(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(row.try_get::<Option<i64>, _>(column)?.map(from_millis))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    Ok(serde_json::from_str(&raw)?)
}

fn version_from_row(row: &SqliteRow) -> Result<WorkflowVersion> {
    Ok(WorkflowVersion {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        version_number: row.try_get("version_number")?,
        nodes: json_column(row, "nodes")?,
        edges: json_column(row, "edges")?,
        settings: json_column(row, "settings")?,
        is_published: row.try_get("is_published")?,
        created_at: from_millis(row.try_get("created_at")?),
    })
}

fn run_from_row(row: &SqliteRow) -> Result<WorkflowRun> {
    Ok(WorkflowRun {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        version_id: row.try_get("version_id")?,
        tenant_id: row.try_get("tenant_id")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        context: json_column(row, "context")?,
        current_node_id: row.try_get("current_node_id")?,
        executed_node_count: row.try_get("executed_node_count")?,
        trigger_data: json_column(row, "trigger_data")?,
        error_message: row.try_get("error_message")?,
        created_at: from_millis(row.try_get("created_at")?),
        started_at: optional_millis(row, "started_at")?,
        completed_at: optional_millis(row, "completed_at")?,
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn node_run_from_row(row: &SqliteRow) -> Result<NodeRun> {
    let output_data = row
        .try_get::<Option<String>, _>("output_data")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;

    Ok(NodeRun {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        node_id: row.try_get("node_id")?,
        node_type: row.try_get("node_type")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        input_data: json_column(row, "input_data")?,
        output_data,
        execution_ms: row.try_get("execution_ms")?,
        error_message: row.try_get("error_message")?,
        started_at: from_millis(row.try_get("started_at")?),
        completed_at: optional_millis(row, "completed_at")?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<ScheduledJob> {
    Ok(ScheduledJob {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        workflow_id: row.try_get("workflow_id")?,
        job_type: row.try_get::<String, _>("job_type")?.parse()?,
        resume_node_id: row.try_get("resume_node_id")?,
        resume_at: from_millis(row.try_get("resume_at")?),
        status: row.try_get::<String, _>("status")?.parse()?,
        error_message: row.try_get("error_message")?,
        created_at: from_millis(row.try_get("created_at")?),
        processed_at: optional_millis(row, "processed_at")?,
    })
}
