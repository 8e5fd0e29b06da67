//! Workspace execution job lifecycle.
//!
//! `ExecutionController` is the single entry point for everything that moves
//! a job between states:
//! 1. Enqueue: one queued job per eligible workspace of a batch spec.
//! 2. Dequeue: claim the next job in fair order and mint its credential.
//! 3. Progress: heartbeats and execution log entries from the worker.
//! 4. Terminal reports: complete, failed, errored, canceled.
//!
//! Cancellation, retry, and the stall/error reset sweep live in their own
//! modules as further `impl` blocks on the same type.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info, instrument, warn};

use adapters::{CredentialStore, RepoAccess};
use db::models::{ExecutionLogEntry, JobRow, JobState};
use db::repository::{batch_specs, jobs, queue, workspaces};
use db::DbPool;

use crate::{LifecycleConfig, PipelineError};

/// Identifies the worker reporting on a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOpts {
    pub worker_hostname: String,
}

impl MarkOpts {
    pub fn worker(hostname: impl Into<String>) -> Self {
        Self { worker_hostname: hostname.into() }
    }
}

/// Non-successful terminal outcomes, all of which release the job's
/// resources before transitioning.
#[derive(Debug, Clone, Copy)]
enum Outcome<'a> {
    Failed(&'a str),
    Errored(&'a str),
    Canceled,
}

/// Stateless orchestrator for the job lifecycle.
///
/// Cheap to clone; every clone shares the pool and collaborators. Mutual
/// exclusion between concurrent callers is left to conditional updates and
/// transactions in the store.
#[derive(Clone)]
pub struct ExecutionController {
    pub(crate) pool: DbPool,
    pub(crate) config: LifecycleConfig,
    pub(crate) repo_access: Arc<dyn RepoAccess>,
    pub(crate) credentials: Arc<dyn CredentialStore>,
}

impl ExecutionController {
    pub fn new(
        pool: DbPool,
        config: LifecycleConfig,
        repo_access: Arc<dyn RepoAccess>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self { pool, config, repo_access, credentials }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Create a queued job for every eligible workspace of the batch spec.
    ///
    /// Workspaces that are skipped, already cached, ignored or unsupported
    /// without the batch spec allowing it, or that already have a job, get
    /// nothing.
    #[instrument(skip(self))]
    pub async fn create_jobs(&self, batch_spec_id: i64) -> Result<Vec<JobRow>, PipelineError> {
        let mut conn = self.pool.acquire().await?;
        batch_specs::get_batch_spec(&mut conn, batch_spec_id).await?;

        let created =
            jobs::create_jobs_for_batch_spec(&mut conn, batch_spec_id, self.config.default_job_version).await?;
        info!(count = created.len(), "enqueued workspace execution jobs");
        Ok(created)
    }

    /// Single-workspace variant of [`Self::create_jobs`]. Returns `None` when
    /// the workspace is not eligible.
    #[instrument(skip(self))]
    pub async fn create_job_for_workspace(&self, workspace_id: i64) -> Result<Option<JobRow>, PipelineError> {
        let mut conn = self.pool.acquire().await?;
        workspaces::get_workspace(&mut conn, workspace_id).await?;

        let created =
            jobs::create_job_for_workspace(&mut conn, workspace_id, self.config.default_job_version).await?;
        if created.is_none() {
            debug!("workspace is not eligible for execution");
        }
        Ok(created)
    }

    /// Flag the batch spec's ignored and unsupported workspaces as skipped,
    /// unless the batch spec allows them.
    #[instrument(skip(self))]
    pub async fn mark_skipped_workspaces(&self, batch_spec_id: i64) -> Result<u64, PipelineError> {
        let mut conn = self.pool.acquire().await?;
        batch_specs::get_batch_spec(&mut conn, batch_spec_id).await?;
        let skipped = workspaces::mark_skipped_workspaces(&mut conn, batch_spec_id).await?;
        info!(skipped, "marked workspaces as skipped");
        Ok(skipped)
    }

    // -----------------------------------------------------------------------
    // Worker protocol
    // -----------------------------------------------------------------------

    /// Claim the next job in fair order for `worker_hostname`.
    ///
    /// Claiming, minting the job's credential, and recording the owner's
    /// dequeue time commit together; a failed mint leaves the job queued.
    #[instrument(skip(self))]
    pub async fn dequeue(&self, worker_hostname: &str) -> Result<Option<JobRow>, PipelineError> {
        if worker_hostname.is_empty() {
            return Err(PipelineError::Validation("worker hostname must not be empty".into()));
        }

        let mut tx = self.pool.begin().await?;
        let Some(mut job) = queue::claim_next(&mut tx, worker_hostname).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let note = format!("batch spec workspace execution job {}", job.id);
        let token_id = self.credentials.create(&mut tx, job.user_id, &note).await?;
        jobs::set_access_token(&mut tx, job.id, Some(token_id)).await?;
        queue::record_dequeue(&mut tx, job.user_id).await?;
        tx.commit().await?;

        job.access_token_id = Some(token_id);
        info!(job_id = job.id, user_id = job.user_id, "dequeued job");
        Ok(Some(job))
    }

    /// Refresh the worker's processing jobs. Returns the ids it still owns;
    /// ids missing from the result should be abandoned by the worker.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn heartbeat(&self, worker_hostname: &str, ids: &[i64]) -> Result<Vec<i64>, PipelineError> {
        let mut conn = self.pool.acquire().await?;
        let alive = jobs::heartbeat(&mut conn, worker_hostname, ids).await?;
        if alive.len() < ids.len() {
            debug!(known = alive.len(), "heartbeat referenced jobs the worker no longer owns");
        }
        Ok(alive)
    }

    /// Append an execution log entry. Returns the entry's index, or `None`
    /// when the worker does not own a processing job with that id.
    #[instrument(skip(self, entry), fields(key = %entry.key))]
    pub async fn add_execution_log_entry(
        &self,
        id: i64,
        opts: &MarkOpts,
        entry: &ExecutionLogEntry,
    ) -> Result<Option<i64>, PipelineError> {
        let mut conn = self.pool.acquire().await?;
        Ok(jobs::append_execution_log(&mut conn, id, &opts.worker_hostname, entry).await?)
    }

    /// Finalize a successful job.
    ///
    /// Returns `Ok(false)` without side effects when the job is not processing
    /// or belongs to another worker. When finalization fails, everything it
    /// wrote is rolled back, the job is marked failed with the error as its
    /// message, and `Ok(false)` is returned.
    ///
    /// Transient store errors are returned as-is and leave the job processing,
    /// so the worker can report completion again.
    #[instrument(skip(self, opts), fields(worker = %opts.worker_hostname))]
    pub async fn mark_complete(&self, id: i64, opts: &MarkOpts) -> Result<bool, PipelineError> {
        let mut tx = self.pool.begin().await?;
        let Some(job) = jobs::lock_processing_job(&mut tx, id, &opts.worker_hostname).await? else {
            tx.rollback().await?;
            debug!("job is not processing on this worker");
            return Ok(false);
        };

        match self.finalize_completion(&mut tx, &job).await {
            Ok(()) => {
                tx.commit().await?;
                info!("job completed");
                Ok(true)
            }
            Err(err) if err.is_transient() => {
                rollback_quietly(tx, job.id).await;
                warn!(error = %err, "finalization hit store contention, job left processing");
                Err(err)
            }
            Err(err) => {
                rollback_quietly(tx, job.id).await;
                self.fail_after_rollback(&job, &err).await?;
                Ok(false)
            }
        }
    }

    #[instrument(skip(self, opts), fields(worker = %opts.worker_hostname))]
    pub async fn mark_failed(&self, id: i64, message: &str, opts: &MarkOpts) -> Result<bool, PipelineError> {
        self.finish_unsuccessfully(id, opts, Outcome::Failed(message)).await
    }

    /// Record a retryable failure. The reset sweep requeues the job until it
    /// has failed `max_num_retries` times.
    #[instrument(skip(self, opts), fields(worker = %opts.worker_hostname))]
    pub async fn mark_errored(&self, id: i64, message: &str, opts: &MarkOpts) -> Result<bool, PipelineError> {
        self.finish_unsuccessfully(id, opts, Outcome::Errored(message)).await
    }

    /// The worker's acknowledgement that it stopped a job flagged for cancellation.
    #[instrument(skip(self, opts), fields(worker = %opts.worker_hostname))]
    pub async fn mark_canceled(&self, id: i64, opts: &MarkOpts) -> Result<bool, PipelineError> {
        self.finish_unsuccessfully(id, opts, Outcome::Canceled).await
    }

    async fn finish_unsuccessfully(&self, id: i64, opts: &MarkOpts, outcome: Outcome<'_>) -> Result<bool, PipelineError> {
        let worker = opts.worker_hostname.as_str();
        let mut tx = self.pool.begin().await?;
        let Some(job) = jobs::lock_processing_job(&mut tx, id, worker).await? else {
            tx.rollback().await?;
            debug!("job is not processing on this worker");
            return Ok(false);
        };

        if let Err(err) = self.release_job_resources(&mut tx, &job).await {
            rollback_quietly(tx, job.id).await;
            if err.is_transient() {
                warn!(error = %err, "releasing job resources hit store contention, job left processing");
                return Err(err);
            }
            return self.fail_after_rollback(&job, &err).await;
        }

        let updated = match outcome {
            Outcome::Failed(message) => jobs::mark_failed(&mut tx, id, worker, message).await?,
            Outcome::Errored(message) => {
                let process_after = self
                    .config
                    .retry_after
                    .and_then(|delay| chrono::Duration::from_std(delay).ok())
                    .map(|delay| Utc::now() + delay);
                let state = jobs::mark_errored(
                    &mut tx,
                    id,
                    worker,
                    message,
                    self.config.max_num_retries,
                    process_after,
                )
                .await?;
                if state == Some(JobState::Failed) {
                    warn!("job exhausted its retries and was marked failed");
                }
                state.is_some()
            }
            Outcome::Canceled => jobs::mark_canceled(&mut tx, id, worker).await?,
        };

        tx.commit().await?;
        info!(?outcome, "job finished");
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Job by id, with its queue position if it is queued.
    pub async fn get_job(&self, id: i64) -> Result<JobRow, PipelineError> {
        let mut conn = self.pool.acquire().await?;
        Ok(queue::get_job(&mut conn, id).await?)
    }

    /// Latest job of a workspace, with its queue position if it is queued.
    pub async fn get_job_by_workspace(&self, workspace_id: i64) -> Result<JobRow, PipelineError> {
        let mut conn = self.pool.acquire().await?;
        Ok(queue::get_job_by_workspace(&mut conn, workspace_id).await?)
    }

    pub async fn list_jobs(&self, opts: &queue::ListJobsOpts) -> Result<Vec<JobRow>, PipelineError> {
        let mut conn = self.pool.acquire().await?;
        Ok(queue::list_jobs(&mut conn, opts).await?)
    }
}

/// Roll back a failed transaction, logging rather than returning a rollback error.
async fn rollback_quietly(tx: Transaction<'_, Sqlite>, job_id: i64) {
    if let Err(err) = tx.rollback().await {
        warn!(job_id, error = %err, "rollback failed");
    }
}
