//! Tuning knobs for the job lifecycle.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// A processing job whose last heartbeat is older than this is stalled.
    #[serde(with = "humantime_serde")]
    pub stalled_max_age: Duration,
    /// Stalled jobs are requeued at most this many times, then failed.
    pub max_num_resets: i64,
    /// Errored jobs are requeued until they have failed this many times.
    pub max_num_retries: i64,
    /// Delay before an errored job becomes dequeueable again.
    #[serde(with = "humantime_serde")]
    pub retry_after: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub cancel_poll_interval: Duration,
    /// Upper bound on how long `cancel_and_wait` waits for workers.
    #[serde(with = "humantime_serde")]
    pub cancel_deadline: Duration,
    /// Version tag given to new jobs unless a retry preserves the old one.
    pub default_job_version: i64,
    /// Interval of the background reset sweep.
    #[serde(with = "humantime_serde")]
    pub reset_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stalled_max_age: Duration::from_secs(60),
            max_num_resets: 3,
            max_num_retries: 3,
            retry_after: None,
            cancel_poll_interval: Duration::from_millis(100),
            cancel_deadline: Duration::from_secs(120),
            default_job_version: 2,
            reset_interval: Duration::from_secs(30),
        }
    }
}
