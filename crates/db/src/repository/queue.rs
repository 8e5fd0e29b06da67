//! Fair queue ranking and dequeue.
//!
//! Rank is a projection recomputed on every query, never stored on the job:
//!
//! * `place_in_user_queue`: row number within the owner's queued jobs,
//!   ordered by job id. Jobs flagged for cancellation never rank.
//! * `place_in_global_queue`: row number over all queued jobs ordered by
//!   `(place_in_user_queue, owner's latest dequeue, job id)`. Owners who never
//!   dequeued sort first, which gives a round-robin across users.

use chrono::Utc;
use sqlx::SqliteConnection;

use super::json_list;
use crate::{
    models::{JobRow, JobState},
    DbError,
};

/// CTE producing `ranked(id, place_in_user_queue, place_in_global_queue)`.
const RANKED_QUEUE: &str = r#"
    user_queues AS (
        SELECT
            j.id,
            j.user_id,
            ROW_NUMBER() OVER (PARTITION BY j.user_id ORDER BY j.id) AS place_in_user_queue
        FROM workspace_execution_jobs j
        WHERE j.state = 'queued' AND NOT j.cancel
    ),
    ranked AS (
        SELECT
            uq.id,
            uq.place_in_user_queue,
            ROW_NUMBER() OVER (
                ORDER BY uq.place_in_user_queue, COALESCE(ld.latest_dequeue, ''), uq.id
            ) AS place_in_global_queue
        FROM user_queues uq
        LEFT JOIN workspace_execution_last_dequeues ld ON ld.user_id = uq.user_id
    )
"#;

/// Filters for [`list_jobs`]. Empty fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct ListJobsOpts {
    pub batch_spec_id: Option<i64>,
    pub states: Vec<JobState>,
    pub ids: Vec<i64>,
    /// Compute queue positions for queued jobs. Skips the window query when false.
    pub with_rank: bool,
}

pub async fn list_jobs(conn: &mut SqliteConnection, opts: &ListJobsOpts) -> Result<Vec<JobRow>, DbError> {
    const FILTER: &str = r#"
        WHERE (?1 IS NULL OR j.batch_spec_workspace_id IN (
                  SELECT id FROM batch_spec_workspaces WHERE batch_spec_id = ?1
              ))
          AND (?2 IS NULL OR j.state IN (SELECT value FROM json_each(?2)))
          AND (?3 IS NULL OR j.id IN (SELECT value FROM json_each(?3)))
        ORDER BY j.id
    "#;

    let sql = if opts.with_rank {
        format!(
            "WITH {RANKED_QUEUE} \
             SELECT j.*, r.place_in_user_queue, r.place_in_global_queue \
             FROM workspace_execution_jobs j LEFT JOIN ranked r ON r.id = j.id {FILTER}"
        )
    } else {
        format!("SELECT j.* FROM workspace_execution_jobs j {FILTER}")
    };

    let rows = sqlx::query_as::<_, JobRow>(&sql)
        .bind(opts.batch_spec_id)
        .bind(json_list(&opts.states)?)
        .bind(json_list(&opts.ids)?)
        .fetch_all(conn)
        .await?;

    Ok(rows)
}

/// Ranked read of a single job.
pub async fn get_job(conn: &mut SqliteConnection, id: i64) -> Result<JobRow, DbError> {
    let opts = ListJobsOpts { ids: vec![id], with_rank: true, ..Default::default() };
    list_jobs(conn, &opts)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| DbError::not_found("job", id))
}

/// Ranked read of the most recent job of a workspace.
pub async fn get_job_by_workspace(conn: &mut SqliteConnection, workspace_id: i64) -> Result<JobRow, DbError> {
    let id: i64 = sqlx::query_scalar(
        "SELECT id FROM workspace_execution_jobs WHERE batch_spec_workspace_id = ?1 ORDER BY id DESC LIMIT 1",
    )
    .bind(workspace_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| DbError::not_found("job for workspace", workspace_id))?;

    get_job(conn, id).await
}

/// Claim the rank-1 queued job whose `process_after` has passed.
///
/// The update is conditional on `state = 'queued'`, so a job can never be
/// handed to two workers. A job flagged for cancellation is never claimed.
pub async fn claim_next(conn: &mut SqliteConnection, worker_hostname: &str) -> Result<Option<JobRow>, DbError> {
    let sql = format!(
        r#"
        WITH {RANKED_QUEUE}
        UPDATE workspace_execution_jobs
        SET state = 'processing', started_at = ?1, last_heartbeat_at = ?1, finished_at = NULL,
            worker_hostname = ?2, updated_at = ?1
        WHERE id = (
            SELECT r.id FROM ranked r
            JOIN workspace_execution_jobs c ON c.id = r.id
            WHERE (c.process_after IS NULL OR c.process_after <= ?1)
              AND NOT c.cancel
            ORDER BY r.place_in_global_queue
            LIMIT 1
        )
          AND state = 'queued'
          AND NOT cancel
        RETURNING *
        "#
    );

    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(Utc::now())
        .bind(worker_hostname)
        .fetch_optional(conn)
        .await?;

    Ok(row)
}

/// Remember when `user_id` last had a job dequeued; feeds the fairness tie-breaker.
pub async fn record_dequeue(conn: &mut SqliteConnection, user_id: i64) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO workspace_execution_last_dequeues (user_id, latest_dequeue)
        VALUES (?1, ?2)
        ON CONFLICT (user_id) DO UPDATE SET latest_dequeue = excluded.latest_dequeue
        "#,
    )
    .bind(user_id)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}
