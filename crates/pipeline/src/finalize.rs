//! Finalization of a job's results.
//!
//! Every step below runs on the caller's open transaction. A caller that sees
//! an error rolls the transaction back and hands the job to
//! [`ExecutionController::fail_after_rollback`], so either everything a
//! finalization writes is visible or none of it is.

use sqlx::SqliteConnection;
use tracing::{debug, error, info, warn};

use db::models::{JobRow, NewCacheEntry};
use db::repository::{batch_specs, cache_entries, changeset_specs, jobs, workspaces};

use crate::changeset::{self, ExecutionResult};
use crate::logs::{self, CacheResults};
use crate::{ExecutionController, PipelineError};

/// Version stamped on every cache entry this pipeline writes.
pub const CACHE_VERSION: i64 = 2;

impl ExecutionController {
    /// Turn a successful job's logs into cache entries and changeset specs,
    /// link them to the workspace, revoke the credential, and complete the job.
    pub(crate) async fn finalize_completion(
        &self,
        conn: &mut SqliteConnection,
        job: &JobRow,
    ) -> Result<(), PipelineError> {
        let workspace = workspaces::get_workspace(conn, job.batch_spec_workspace_id).await?;
        let batch_spec = batch_specs::get_batch_spec(conn, workspace.batch_spec_id).await?;

        if !self.repo_access.can_read(batch_spec.user_id, workspace.repo_id).await? {
            return Err(PipelineError::RepoAccessRevoked {
                user_id: batch_spec.user_id,
                repo_id: workspace.repo_id,
            });
        }

        let results = logs::extract_cache_results(job.id, &job.execution_logs.0)?;
        store_cache_results(conn, batch_spec.user_id, &results).await?;

        let mut spec_ids = Vec::new();
        if let Some(execution) = &results.execution {
            let result = ExecutionResult::decode(&execution.value)?;
            for spec in changeset::build_changeset_specs(&batch_spec, &workspace, &result)? {
                spec_ids.push(changeset_specs::insert_changeset_spec(conn, &spec).await?.id);
            }
        }
        workspaces::set_changeset_spec_ids(conn, workspace.id, &spec_ids).await?;

        self.revoke_access_token(conn, job).await?;

        if !jobs::mark_completed(conn, job.id, &job.worker_hostname).await? {
            return Err(PipelineError::NotFound { entity: "processing job", id: job.id });
        }

        info!(
            job_id = job.id,
            cache_entries = results.len(),
            changeset_specs = spec_ids.len(),
            "finalized job"
        );
        Ok(())
    }

    /// Pre-step of every non-successful terminal transition: keep whatever
    /// cache results the job produced before it stopped, and revoke its
    /// credential. A job that never got as far as the driver has nothing to keep.
    pub(crate) async fn release_job_resources(
        &self,
        conn: &mut SqliteConnection,
        job: &JobRow,
    ) -> Result<(), PipelineError> {
        match logs::extract_cache_results(job.id, &job.execution_logs.0) {
            Ok(results) => store_cache_results(conn, job.user_id, &results).await?,
            Err(PipelineError::NoDriverLog(_)) => debug!(job_id = job.id, "no driver log, nothing to cache"),
            Err(err) => return Err(err),
        }
        self.revoke_access_token(conn, job).await
    }

    /// Fallback after a rolled-back finalization: outside any transaction,
    /// revoke the credential if possible and mark the job failed with `cause`.
    pub(crate) async fn fail_after_rollback(&self, job: &JobRow, cause: &PipelineError) -> Result<bool, PipelineError> {
        error!(job_id = job.id, error = %cause, "finalization failed, marking job as failed");
        let mut conn = self.pool.acquire().await?;

        if let Some(token_id) = job.access_token_id {
            match self.credentials.hard_delete(&mut conn, token_id).await {
                Ok(()) => jobs::set_access_token(&mut conn, job.id, None).await?,
                Err(err) => warn!(
                    job_id = job.id,
                    token_id,
                    error = %err,
                    "could not revoke access token of failed job, it must be deleted manually"
                ),
            }
        }

        Ok(jobs::mark_failed(&mut conn, job.id, &job.worker_hostname, &cause.to_string()).await?)
    }

    async fn revoke_access_token(&self, conn: &mut SqliteConnection, job: &JobRow) -> Result<(), PipelineError> {
        if let Some(token_id) = job.access_token_id {
            self.credentials.hard_delete(conn, token_id).await?;
            jobs::set_access_token(conn, job.id, None).await?;
        }
        Ok(())
    }
}

async fn store_cache_results(
    conn: &mut SqliteConnection,
    user_id: i64,
    results: &CacheResults,
) -> Result<(), PipelineError> {
    for result in results.iter() {
        let entry = NewCacheEntry {
            user_id,
            key: result.key.clone(),
            value: result.value.clone(),
            version: CACHE_VERSION,
        };
        cache_entries::upsert_cache_entry(conn, &entry).await?;
    }
    Ok(())
}
