//! Workspace execution job repository functions.
//!
//! State transitions are conditional updates: every `mark_*` function only
//! touches a job that is still `processing` and owned by the reporting worker,
//! and reports whether a row changed. Ranked reads live in [`super::queue`].

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqliteConnection;

use super::json_list;
use crate::{
    models::{ExecutionLogEntry, JobRow, JobState},
    DbError,
};

// ---------------------------------------------------------------------------
// creation
// ---------------------------------------------------------------------------

/// Insert one queued job per eligible workspace and return them ordered by id.
///
/// A workspace is eligible when it passes the skip predicate and has no job
/// yet. `scope_column` selects the workspace column matched against `scope_id`.
async fn insert_jobs_for_workspaces(
    conn: &mut SqliteConnection,
    scope_column: &str,
    scope_id: i64,
    version: i64,
) -> Result<Vec<JobRow>, DbError> {
    let now = Utc::now();
    let sql = format!(
        r#"
        INSERT INTO workspace_execution_jobs
            (batch_spec_workspace_id, user_id, state, queued_at, version, created_at, updated_at)
        SELECT w.id, bs.user_id, 'queued', ?2, ?3, ?2, ?2
        FROM batch_spec_workspaces w
        JOIN batch_specs bs ON bs.id = w.batch_spec_id
        WHERE w.{scope_column} = ?1
          AND NOT (w.ignored AND NOT bs.allow_ignored)
          AND NOT (w.unsupported AND NOT bs.allow_unsupported)
          AND NOT w.cached_result_found
          AND NOT w.skipped
          AND NOT EXISTS (
              SELECT 1 FROM workspace_execution_jobs j WHERE j.batch_spec_workspace_id = w.id
          )
        ORDER BY w.id
        RETURNING *
        "#
    );

    let mut rows = sqlx::query_as::<_, JobRow>(&sql)
        .bind(scope_id)
        .bind(now)
        .bind(version)
        .fetch_all(conn)
        .await?;

    rows.sort_by_key(|row| row.id);
    Ok(rows)
}

pub async fn create_jobs_for_batch_spec(
    conn: &mut SqliteConnection,
    batch_spec_id: i64,
    version: i64,
) -> Result<Vec<JobRow>, DbError> {
    insert_jobs_for_workspaces(conn, "batch_spec_id", batch_spec_id, version).await
}

pub async fn create_job_for_workspace(
    conn: &mut SqliteConnection,
    workspace_id: i64,
    version: i64,
) -> Result<Option<JobRow>, DbError> {
    let rows = insert_jobs_for_workspaces(conn, "id", workspace_id, version).await?;
    Ok(rows.into_iter().next())
}

/// Unconditionally insert a fresh queued job for a workspace.
pub async fn insert_job(
    conn: &mut SqliteConnection,
    workspace_id: i64,
    user_id: i64,
    version: i64,
) -> Result<JobRow, DbError> {
    let now = Utc::now();
    let row = sqlx::query_as::<_, JobRow>(
        r#"
        INSERT INTO workspace_execution_jobs
            (batch_spec_workspace_id, user_id, state, queued_at, version, created_at, updated_at)
        VALUES (?1, ?2, 'queued', ?3, ?4, ?3, ?3)
        RETURNING *
        "#,
    )
    .bind(workspace_id)
    .bind(user_id)
    .bind(now)
    .bind(version)
    .fetch_one(conn)
    .await?;

    Ok(row)
}

pub async fn delete_job(conn: &mut SqliteConnection, id: i64) -> Result<(), DbError> {
    sqlx::query("DELETE FROM workspace_execution_jobs WHERE id = ?1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// reads
// ---------------------------------------------------------------------------

/// Fetch a job without queue rank.
pub async fn get_job_unranked(conn: &mut SqliteConnection, id: i64) -> Result<JobRow, DbError> {
    sqlx::query_as::<_, JobRow>("SELECT * FROM workspace_execution_jobs WHERE id = ?1")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::not_found("job", id))
}

/// Lock a job for finalization if it is processing and owned by
/// `worker_hostname`.
///
/// A write as the first statement of a transaction takes SQLite's write lock
/// under the busy timeout; reading first would fail a later upgrade instead.
pub async fn lock_processing_job(
    conn: &mut SqliteConnection,
    id: i64,
    worker_hostname: &str,
) -> Result<Option<JobRow>, DbError> {
    let row = sqlx::query_as::<_, JobRow>(
        r#"
        UPDATE workspace_execution_jobs SET updated_at = ?1
        WHERE id = ?2 AND state = 'processing' AND worker_hostname = ?3
        RETURNING *
        "#,
    )
    .bind(Utc::now())
    .bind(id)
    .bind(worker_hostname)
    .fetch_optional(conn)
    .await?;

    Ok(row)
}

/// Lock the jobs of `batch_spec_id` (or of the given workspaces) that are not
/// live, i.e. candidates for a retry. Ordered by id.
pub async fn lock_retriable_jobs(
    conn: &mut SqliteConnection,
    batch_spec_id: Option<i64>,
    workspace_ids: &[i64],
    include_completed: bool,
) -> Result<Vec<JobRow>, DbError> {
    let mut rows = sqlx::query_as::<_, JobRow>(
        r#"
        UPDATE workspace_execution_jobs SET updated_at = ?4
        WHERE id IN (
            SELECT j.id FROM workspace_execution_jobs j
            JOIN batch_spec_workspaces w ON w.id = j.batch_spec_workspace_id
            WHERE (?1 IS NULL OR w.batch_spec_id = ?1)
              AND (?2 IS NULL OR w.id IN (SELECT value FROM json_each(?2)))
              AND j.state NOT IN ('queued', 'processing')
              AND (?3 OR j.state != 'completed')
        )
        RETURNING *
        "#,
    )
    .bind(batch_spec_id)
    .bind(json_list(workspace_ids)?)
    .bind(include_completed)
    .bind(Utc::now())
    .fetch_all(conn)
    .await?;

    rows.sort_by_key(|row| row.id);
    Ok(rows)
}

pub async fn count_processing_for_batch_spec(
    conn: &mut SqliteConnection,
    batch_spec_id: i64,
) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM workspace_execution_jobs j
        JOIN batch_spec_workspaces w ON w.id = j.batch_spec_workspace_id
        WHERE w.batch_spec_id = ?1 AND j.state = 'processing'
        "#,
    )
    .bind(batch_spec_id)
    .fetch_one(conn)
    .await?;

    Ok(count)
}

/// Ids of processing jobs owned by the worker whose cancel flag is set.
pub async fn list_canceled_ids(
    conn: &mut SqliteConnection,
    worker_hostname: &str,
) -> Result<Vec<i64>, DbError> {
    let ids = sqlx::query_scalar(
        r#"
        SELECT id FROM workspace_execution_jobs
        WHERE worker_hostname = ?1 AND state = 'processing' AND cancel
        ORDER BY id
        "#,
    )
    .bind(worker_hostname)
    .fetch_all(conn)
    .await?;

    Ok(ids)
}

// ---------------------------------------------------------------------------
// worker-side updates
// ---------------------------------------------------------------------------

/// Refresh `last_heartbeat_at` on the worker's processing jobs among `ids`.
/// Returns the ids the worker still owns.
pub async fn heartbeat(
    conn: &mut SqliteConnection,
    worker_hostname: &str,
    ids: &[i64],
) -> Result<Vec<i64>, DbError> {
    let Some(ids) = json_list(ids)? else {
        return Ok(Vec::new());
    };

    let mut alive: Vec<i64> = sqlx::query_scalar(
        r#"
        UPDATE workspace_execution_jobs
        SET last_heartbeat_at = ?1, updated_at = ?1
        WHERE worker_hostname = ?2
          AND state = 'processing'
          AND id IN (SELECT value FROM json_each(?3))
        RETURNING id
        "#,
    )
    .bind(Utc::now())
    .bind(worker_hostname)
    .bind(ids)
    .fetch_all(conn)
    .await?;

    alive.sort_unstable();
    Ok(alive)
}

/// Append a log entry. Returns its index, or `None` if the worker no longer
/// owns a processing job with that id.
pub async fn append_execution_log(
    conn: &mut SqliteConnection,
    id: i64,
    worker_hostname: &str,
    entry: &ExecutionLogEntry,
) -> Result<Option<i64>, DbError> {
    let len: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE workspace_execution_jobs
        SET execution_logs = json_insert(execution_logs, '$[#]', json(?1)), updated_at = ?2
        WHERE id = ?3 AND state = 'processing' AND worker_hostname = ?4
        RETURNING json_array_length(execution_logs)
        "#,
    )
    .bind(serde_json::to_string(entry)?)
    .bind(Utc::now())
    .bind(id)
    .bind(worker_hostname)
    .fetch_optional(conn)
    .await?;

    Ok(len.map(|len| len - 1))
}

pub async fn set_access_token(
    conn: &mut SqliteConnection,
    id: i64,
    access_token_id: Option<i64>,
) -> Result<(), DbError> {
    sqlx::query("UPDATE workspace_execution_jobs SET access_token_id = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(access_token_id)
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// terminal transitions
// ---------------------------------------------------------------------------

pub async fn mark_completed(
    conn: &mut SqliteConnection,
    id: i64,
    worker_hostname: &str,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE workspace_execution_jobs
        SET state = 'completed', finished_at = ?1, updated_at = ?1
        WHERE id = ?2 AND state = 'processing' AND worker_hostname = ?3
        "#,
    )
    .bind(Utc::now())
    .bind(id)
    .bind(worker_hostname)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn mark_failed(
    conn: &mut SqliteConnection,
    id: i64,
    worker_hostname: &str,
    failure_message: &str,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE workspace_execution_jobs
        SET state = 'failed', failure_message = ?1, num_failures = num_failures + 1,
            finished_at = ?2, updated_at = ?2
        WHERE id = ?3 AND state = 'processing' AND worker_hostname = ?4
        "#,
    )
    .bind(failure_message)
    .bind(Utc::now())
    .bind(id)
    .bind(worker_hostname)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Record a retryable failure. Once `num_failures` reaches `max_num_retries`
/// the job goes straight to `failed` instead. `process_after` delays the
/// requeued attempt.
pub async fn mark_errored(
    conn: &mut SqliteConnection,
    id: i64,
    worker_hostname: &str,
    failure_message: &str,
    max_num_retries: i64,
    process_after: Option<DateTime<Utc>>,
) -> Result<Option<JobState>, DbError> {
    let state: Option<JobState> = sqlx::query_scalar(
        r#"
        UPDATE workspace_execution_jobs
        SET state = CASE WHEN num_failures + 1 >= ?1 THEN 'failed' ELSE 'errored' END,
            failure_message = ?2, num_failures = num_failures + 1,
            process_after = ?3, finished_at = ?4, updated_at = ?4
        WHERE id = ?5 AND state = 'processing' AND worker_hostname = ?6
        RETURNING state
        "#,
    )
    .bind(max_num_retries)
    .bind(failure_message)
    .bind(process_after)
    .bind(Utc::now())
    .bind(id)
    .bind(worker_hostname)
    .fetch_optional(conn)
    .await?;

    Ok(state)
}

pub async fn mark_canceled(
    conn: &mut SqliteConnection,
    id: i64,
    worker_hostname: &str,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE workspace_execution_jobs
        SET state = 'canceled', cancel = TRUE, finished_at = ?1, updated_at = ?1
        WHERE id = ?2 AND state = 'processing' AND worker_hostname = ?3
        "#,
    )
    .bind(Utc::now())
    .bind(id)
    .bind(worker_hostname)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// administrative updates
// ---------------------------------------------------------------------------

/// Flag jobs for cancellation.
///
/// Queued and errored jobs are canceled outright; processing jobs only get
/// the flag and are left for their worker to stop. Jobs that are terminal or
/// already flagged are untouched, so repeating the call changes nothing.
pub async fn cancel_jobs(
    conn: &mut SqliteConnection,
    batch_spec_id: Option<i64>,
    ids: &[i64],
) -> Result<Vec<JobRow>, DbError> {
    let mut rows = sqlx::query_as::<_, JobRow>(
        r#"
        UPDATE workspace_execution_jobs
        SET cancel = TRUE,
            state = CASE WHEN state = 'processing' THEN state ELSE 'canceled' END,
            finished_at = CASE WHEN state = 'processing' THEN finished_at ELSE ?1 END,
            updated_at = ?1
        WHERE (state IN ('queued', 'errored') OR (state = 'processing' AND NOT cancel))
          AND (?2 IS NULL OR batch_spec_workspace_id IN (
              SELECT id FROM batch_spec_workspaces WHERE batch_spec_id = ?2
          ))
          AND (?3 IS NULL OR id IN (SELECT value FROM json_each(?3)))
        RETURNING *
        "#,
    )
    .bind(Utc::now())
    .bind(batch_spec_id)
    .bind(json_list(ids)?)
    .fetch_all(conn)
    .await?;

    rows.sort_by_key(|row| row.id);
    Ok(rows)
}

/// Requeue processing jobs whose heartbeat is older than `stalled_before` and
/// that have been reset fewer than `max_num_resets` times.
///
/// Stalled jobs flagged for cancellation are canceled instead, whatever
/// their reset count.
pub async fn reset_stalled(
    conn: &mut SqliteConnection,
    stalled_before: DateTime<Utc>,
    max_num_resets: i64,
) -> Result<Vec<JobRow>, DbError> {
    let rows = sqlx::query_as::<_, JobRow>(
        r#"
        UPDATE workspace_execution_jobs
        SET state = CASE WHEN cancel THEN 'canceled' ELSE 'queued' END,
            num_resets = num_resets + CASE WHEN cancel THEN 0 ELSE 1 END,
            finished_at = CASE WHEN cancel THEN ?1 ELSE NULL END,
            started_at = CASE WHEN cancel THEN started_at ELSE NULL END,
            worker_hostname = CASE WHEN cancel THEN worker_hostname ELSE '' END,
            queued_at = CASE WHEN cancel THEN queued_at ELSE ?1 END,
            last_heartbeat_at = NULL, updated_at = ?1
        WHERE state = 'processing'
          AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?2)
          AND (cancel OR num_resets < ?3)
        RETURNING *
        "#,
    )
    .bind(Utc::now())
    .bind(stalled_before)
    .bind(max_num_resets)
    .fetch_all(conn)
    .await?;

    Ok(rows)
}

/// Fail stalled processing jobs that have exhausted their resets. Jobs
/// flagged for cancellation are left to [`reset_stalled`].
pub async fn fail_stalled(
    conn: &mut SqliteConnection,
    stalled_before: DateTime<Utc>,
    max_num_resets: i64,
    failure_message: &str,
) -> Result<Vec<JobRow>, DbError> {
    let rows = sqlx::query_as::<_, JobRow>(
        r#"
        UPDATE workspace_execution_jobs
        SET state = 'failed', failure_message = ?1, finished_at = ?2, updated_at = ?2
        WHERE state = 'processing'
          AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?3)
          AND num_resets >= ?4
          AND NOT cancel
        RETURNING *
        "#,
    )
    .bind(failure_message)
    .bind(Utc::now())
    .bind(stalled_before)
    .bind(max_num_resets)
    .fetch_all(conn)
    .await?;

    Ok(rows)
}

/// Requeue errored jobs that still have retries left. Errored jobs flagged
/// for cancellation are canceled instead.
pub async fn reset_errored(
    conn: &mut SqliteConnection,
    max_num_retries: i64,
) -> Result<Vec<JobRow>, DbError> {
    let rows = sqlx::query_as::<_, JobRow>(
        r#"
        UPDATE workspace_execution_jobs
        SET state = CASE WHEN cancel THEN 'canceled' ELSE 'queued' END,
            finished_at = CASE WHEN cancel THEN ?1 ELSE NULL END,
            started_at = CASE WHEN cancel THEN started_at ELSE NULL END,
            worker_hostname = CASE WHEN cancel THEN worker_hostname ELSE '' END,
            queued_at = CASE WHEN cancel THEN queued_at ELSE ?1 END,
            last_heartbeat_at = NULL, updated_at = ?1
        WHERE state = 'errored' AND (cancel OR num_failures < ?2)
        RETURNING *
        "#,
    )
    .bind(Utc::now())
    .bind(max_num_retries)
    .fetch_all(conn)
    .await?;

    Ok(rows)
}

/// Persist a log list wholesale; used by fixtures that seed finished logs.
pub async fn set_execution_logs(
    conn: &mut SqliteConnection,
    id: i64,
    entries: &[ExecutionLogEntry],
) -> Result<(), DbError> {
    sqlx::query("UPDATE workspace_execution_jobs SET execution_logs = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(Json(entries))
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}
