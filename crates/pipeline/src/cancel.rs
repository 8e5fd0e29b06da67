//! Cooperative cancellation.
//!
//! Queued jobs are canceled on the spot. Processing jobs only get their
//! `cancel` flag set: the worker discovers it through `fetch_canceled`, stops,
//! and reports back with `mark_canceled`.

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use db::models::JobRow;
use db::repository::{batch_specs, jobs, queue};

use crate::{ExecutionController, PipelineError};

/// Which jobs to cancel. At least one filter is required; both together
/// select their intersection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CancelOpts {
    pub batch_spec_id: Option<i64>,
    pub ids: Vec<i64>,
}

impl CancelOpts {
    pub fn batch_spec(batch_spec_id: i64) -> Self {
        Self { batch_spec_id: Some(batch_spec_id), ids: Vec::new() }
    }
}

impl ExecutionController {
    /// Cancel queued jobs and flag processing ones. Returns the jobs changed
    /// by this call; repeating it changes nothing.
    #[instrument(skip(self))]
    pub async fn cancel_jobs(&self, opts: &CancelOpts) -> Result<Vec<JobRow>, PipelineError> {
        if opts.batch_spec_id.is_none() && opts.ids.is_empty() {
            return Err(PipelineError::Validation("cancel requires a batch spec id or job ids".into()));
        }

        let mut conn = self.pool.acquire().await?;
        let changed = jobs::cancel_jobs(&mut conn, opts.batch_spec_id, &opts.ids).await?;
        info!(count = changed.len(), "canceled jobs");
        Ok(changed)
    }

    /// Cancel every job of the batch spec and wait until no job of it is
    /// processing any more, polling every `cancel_poll_interval` for at most
    /// `cancel_deadline`. Returns the final state of the jobs it touched.
    #[instrument(skip(self))]
    pub async fn cancel_and_wait(&self, batch_spec_id: i64) -> Result<Vec<JobRow>, PipelineError> {
        {
            let mut conn = self.pool.acquire().await?;
            batch_specs::get_batch_spec(&mut conn, batch_spec_id).await?;
        }

        let deadline = Instant::now() + self.config.cancel_deadline;
        let opts = CancelOpts::batch_spec(batch_spec_id);
        let mut touched = Vec::new();

        loop {
            touched.extend(self.cancel_jobs(&opts).await?.into_iter().map(|job| job.id));

            let remaining = {
                let mut conn = self.pool.acquire().await?;
                jobs::count_processing_for_batch_spec(&mut conn, batch_spec_id).await?
            };
            if remaining == 0 {
                break;
            }
            if Instant::now() + self.config.cancel_poll_interval > deadline {
                warn!(remaining, "jobs still processing at cancellation deadline");
                return Err(PipelineError::CancelDeadlineExceeded { remaining });
            }

            debug!(remaining, "waiting for workers to stop");
            sleep(self.config.cancel_poll_interval).await;
        }

        touched.sort_unstable();
        touched.dedup();
        let opts = queue::ListJobsOpts { ids: touched, ..Default::default() };
        let mut conn = self.pool.acquire().await?;
        Ok(queue::list_jobs(&mut conn, &opts).await?)
    }

    /// Ids of the worker's processing jobs that were flagged for cancellation.
    pub async fn fetch_canceled(&self, worker_hostname: &str) -> Result<Vec<i64>, PipelineError> {
        let mut conn = self.pool.acquire().await?;
        Ok(jobs::list_canceled_ids(&mut conn, worker_hostname).await?)
    }
}
