//! Manual retry of finished jobs.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use db::models::JobRow;
use db::repository::{changeset_specs, jobs, workspaces};

use crate::{ExecutionController, PipelineError};

/// Which jobs to retry. At least one of `batch_spec_id` or `workspace_ids`
/// is required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOpts {
    pub batch_spec_id: Option<i64>,
    pub workspace_ids: Vec<i64>,
    /// Also retry completed jobs, discarding their changeset specs.
    pub include_completed: bool,
    /// Keep the old job's version instead of the configured default.
    pub preserve_version: bool,
}

impl ExecutionController {
    /// Replace every matching finished job with a fresh queued one.
    ///
    /// For each job the old row, the changeset specs linked to its workspace,
    /// and the workspace's link list are discarded. The whole batch runs in
    /// one transaction. Queued and processing jobs are never touched.
    #[instrument(skip(self))]
    pub async fn retry_jobs(&self, opts: &RetryOpts) -> Result<Vec<JobRow>, PipelineError> {
        if opts.batch_spec_id.is_none() && opts.workspace_ids.is_empty() {
            return Err(PipelineError::Validation("retry requires a batch spec id or workspace ids".into()));
        }

        let mut tx = self.pool.begin().await?;
        let candidates =
            jobs::lock_retriable_jobs(&mut tx, opts.batch_spec_id, &opts.workspace_ids, opts.include_completed)
                .await?;

        let mut requeued = Vec::with_capacity(candidates.len());
        for old in candidates {
            let workspace = workspaces::get_workspace(&mut tx, old.batch_spec_workspace_id).await?;
            changeset_specs::delete_changeset_specs(&mut tx, &workspace.changeset_spec_ids.0).await?;
            workspaces::set_changeset_spec_ids(&mut tx, workspace.id, &[]).await?;

            if let Some(token_id) = old.access_token_id {
                if let Err(err) = self.credentials.hard_delete(&mut tx, token_id).await {
                    warn!(job_id = old.id, token_id, error = %err, "could not revoke leftover access token");
                }
            }

            jobs::delete_job(&mut tx, old.id).await?;
            let version = if opts.preserve_version { old.version } else { self.config.default_job_version };
            requeued.push(jobs::insert_job(&mut tx, workspace.id, old.user_id, version).await?);
        }

        tx.commit().await?;
        info!(count = requeued.len(), "retried jobs");
        Ok(requeued)
    }
}
