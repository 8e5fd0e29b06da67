//! Background reset sweep.
//!
//! Requeues processing jobs whose worker stopped heartbeating and errored
//! jobs that still have retries left. Stalled jobs that ran out of resets are
//! failed instead. Jobs flagged for cancellation are never requeued: both
//! passes cancel them.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::SqliteConnection;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use db::models::{JobRow, JobState};
use db::repository::jobs;

use crate::{ExecutionController, PipelineError};

const STALLED_MESSAGE: &str = "job stalled: worker stopped sending heartbeats";
const MIN_RESET_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetStats {
    pub requeued_stalled: usize,
    pub failed_stalled: usize,
    pub requeued_errored: usize,
    /// Stalled or errored jobs that were flagged for cancellation.
    pub canceled: usize,
}

impl ResetStats {
    pub fn total(&self) -> usize {
        self.requeued_stalled + self.failed_stalled + self.requeued_errored + self.canceled
    }
}

impl ExecutionController {
    /// Run one reset pass over stalled and errored jobs.
    #[instrument(skip(self))]
    pub async fn reset_sweep(&self) -> Result<ResetStats, PipelineError> {
        let max_age = chrono::Duration::from_std(self.config.stalled_max_age)
            .map_err(|err| PipelineError::Validation(format!("stalled_max_age: {err}")))?;
        let stalled_before = Utc::now() - max_age;

        let mut conn = self.pool.acquire().await?;
        let stalled = jobs::reset_stalled(&mut conn, stalled_before, self.config.max_num_resets).await?;
        let failed =
            jobs::fail_stalled(&mut conn, stalled_before, self.config.max_num_resets, STALLED_MESSAGE).await?;
        for job in stalled.iter().chain(failed.iter()) {
            self.revoke_quietly(&mut conn, job).await;
        }
        let errored = jobs::reset_errored(&mut conn, self.config.max_num_retries).await?;

        let (stalled_canceled, errored_canceled) = (count_canceled(&stalled), count_canceled(&errored));
        if stalled_canceled + errored_canceled > 0 {
            info!(stalled_canceled, errored_canceled, "canceled flagged jobs instead of requeueing them");
        }

        Ok(ResetStats {
            requeued_stalled: stalled.len() - stalled_canceled,
            failed_stalled: failed.len(),
            requeued_errored: errored.len() - errored_canceled,
            canceled: stalled_canceled + errored_canceled,
        })
    }

    /// A reset job gets a new credential at its next dequeue; drop the old one.
    async fn revoke_quietly(&self, conn: &mut SqliteConnection, job: &JobRow) {
        let Some(token_id) = job.access_token_id else { return };
        match self.credentials.hard_delete(conn, token_id).await {
            Ok(()) => {
                if let Err(err) = jobs::set_access_token(conn, job.id, None).await {
                    warn!(job_id = job.id, error = %err, "could not clear access token reference");
                }
            }
            Err(err) => warn!(job_id = job.id, token_id, error = %err, "could not revoke access token of reset job"),
        }
    }
}

fn count_canceled(rows: &[JobRow]) -> usize {
    rows.iter().filter(|job| job.state == JobState::Canceled).count()
}

/// Run [`ExecutionController::reset_sweep`] every `reset_interval` until
/// `shutdown` is cancelled.
pub async fn run_resetter(controller: ExecutionController, shutdown: CancellationToken) {
    let period = controller.config().reset_interval.max(MIN_RESET_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval = ?period, "job resetter started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("job resetter stopped");
                return;
            }
            _ = ticker.tick() => match controller.reset_sweep().await {
                Ok(stats) if stats.total() > 0 => info!(?stats, "reset sweep"),
                Ok(_) => debug!("reset sweep found nothing"),
                Err(err) => error!(error = %err, "reset sweep failed"),
            },
        }
    }
}
