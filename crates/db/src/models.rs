//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models: they carry no domain behaviour.
//! JSON-valued columns are wrapped in [`sqlx::types::Json`] and stored as text.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// batch_specs
// ---------------------------------------------------------------------------

/// The slice of a batch spec the execution pipeline reads.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BatchSpecRow {
    pub id: i64,
    pub user_id: i64,
    pub allow_unsupported: bool,
    pub allow_ignored: bool,
    /// Changeset template and `transformChanges` block, kept as raw JSON.
    pub changeset_template: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewBatchSpec {
    pub user_id: i64,
    pub allow_unsupported: bool,
    pub allow_ignored: bool,
    pub changeset_template: serde_json::Value,
}

// ---------------------------------------------------------------------------
// batch_spec_workspaces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStep {
    pub run: String,
    pub container: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A cache key resolved for one step ahead of execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCacheResult {
    pub key: String,
}

/// One (batch spec, repository, revision, path) tuple.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkspaceRow {
    pub id: i64,
    pub batch_spec_id: i64,
    pub repo_id: i64,
    pub repo_name: String,
    pub branch: String,
    pub commit_sha: String,
    pub path: String,
    pub file_matches: Json<Vec<String>>,
    pub steps: Json<Vec<WorkspaceStep>>,
    pub only_fetch_workspace: bool,
    pub unsupported: bool,
    pub ignored: bool,
    pub skipped: bool,
    pub cached_result_found: bool,
    /// Step index → cache key.
    pub step_cache_results: Json<BTreeMap<i64, StepCacheResult>>,
    pub changeset_spec_ids: Json<Vec<i64>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewWorkspace {
    pub batch_spec_id: i64,
    pub repo_id: i64,
    pub repo_name: String,
    pub branch: String,
    pub commit_sha: String,
    pub path: String,
    pub file_matches: Vec<String>,
    pub steps: Vec<WorkspaceStep>,
    pub only_fetch_workspace: bool,
    pub unsupported: bool,
    pub ignored: bool,
    pub cached_result_found: bool,
    pub step_cache_results: BTreeMap<i64, StepCacheResult>,
}

// ---------------------------------------------------------------------------
// workspace_execution_jobs
// ---------------------------------------------------------------------------

/// Lifecycle states of a workspace execution job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    Errored,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Canceled => "canceled",
        }
    }

    /// Queued and processing jobs count against the one-per-workspace limit.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued"     => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed"  => Ok(Self::Completed),
            "failed"     => Ok(Self::Failed),
            "errored"    => Ok(Self::Errored),
            "canceled"   => Ok(Self::Canceled),
            other        => Err(format!("unknown job state: {other}")),
        }
    }
}

/// One entry of a job's append-only execution log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub key: String,
    #[serde(default)]
    pub command: Vec<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub out: String,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

/// A persisted workspace execution job row.
///
/// `place_in_user_queue` and `place_in_global_queue` are only populated by
/// ranked reads, and only for queued jobs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub batch_spec_workspace_id: i64,
    pub user_id: i64,
    pub state: JobState,
    pub failure_message: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub process_after: Option<DateTime<Utc>>,
    pub num_resets: i64,
    pub num_failures: i64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub execution_logs: Json<Vec<ExecutionLogEntry>>,
    pub worker_hostname: String,
    pub cancel: bool,
    pub access_token_id: Option<i64>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(default)]
    pub place_in_user_queue: Option<i64>,
    #[sqlx(default)]
    pub place_in_global_queue: Option<i64>,
}

// ---------------------------------------------------------------------------
// execution_cache_entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CacheEntryRow {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    /// Opaque serialized payload. Never rewritten once stored.
    pub value: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    pub user_id: i64,
    pub key: String,
    pub value: String,
    pub version: i64,
}

// ---------------------------------------------------------------------------
// changeset_specs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChangesetSpecRow {
    pub id: i64,
    pub rand_id: String,
    pub batch_spec_id: i64,
    pub repo_id: i64,
    pub user_id: i64,
    pub base_ref: String,
    pub base_rev: String,
    pub head_ref: String,
    pub title: String,
    pub body: String,
    pub commit_message: String,
    pub commit_author_name: String,
    pub commit_author_email: String,
    pub published: Option<Json<serde_json::Value>>,
    pub diff: String,
    pub diff_stat_added: i64,
    pub diff_stat_deleted: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewChangesetSpec {
    pub batch_spec_id: i64,
    pub repo_id: i64,
    pub user_id: i64,
    pub base_ref: String,
    pub base_rev: String,
    pub head_ref: String,
    pub title: String,
    pub body: String,
    pub commit_message: String,
    pub commit_author_name: String,
    pub commit_author_email: String,
    pub published: Option<serde_json::Value>,
    pub diff: String,
    pub diff_stat_added: i64,
    pub diff_stat_deleted: i64,
}

// ---------------------------------------------------------------------------
// access_tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccessTokenRow {
    pub id: i64,
    pub user_id: i64,
    pub note: String,
    pub created_at: DateTime<Utc>,
}
