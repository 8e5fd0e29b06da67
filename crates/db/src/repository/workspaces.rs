//! Batch spec workspace repository functions.

use chrono::Utc;
use sqlx::types::Json;
use sqlx::SqliteConnection;

use crate::{
    models::{NewWorkspace, WorkspaceRow},
    DbError,
};

pub async fn create_workspace(
    conn: &mut SqliteConnection,
    ws: &NewWorkspace,
) -> Result<WorkspaceRow, DbError> {
    let now = Utc::now();

    let row = sqlx::query_as::<_, WorkspaceRow>(
        r#"
        INSERT INTO batch_spec_workspaces
            (batch_spec_id, repo_id, repo_name, branch, commit_sha, path, file_matches, steps,
             only_fetch_workspace, unsupported, ignored, cached_result_found, step_cache_results,
             created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
        RETURNING *
        "#,
    )
    .bind(ws.batch_spec_id)
    .bind(ws.repo_id)
    .bind(&ws.repo_name)
    .bind(&ws.branch)
    .bind(&ws.commit_sha)
    .bind(&ws.path)
    .bind(Json(&ws.file_matches))
    .bind(Json(&ws.steps))
    .bind(ws.only_fetch_workspace)
    .bind(ws.unsupported)
    .bind(ws.ignored)
    .bind(ws.cached_result_found)
    .bind(Json(&ws.step_cache_results))
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(row)
}

pub async fn get_workspace(conn: &mut SqliteConnection, id: i64) -> Result<WorkspaceRow, DbError> {
    sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM batch_spec_workspaces WHERE id = ?1")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::not_found("workspace", id))
}

pub async fn list_workspaces(
    conn: &mut SqliteConnection,
    batch_spec_id: i64,
) -> Result<Vec<WorkspaceRow>, DbError> {
    let rows = sqlx::query_as::<_, WorkspaceRow>(
        "SELECT * FROM batch_spec_workspaces WHERE batch_spec_id = ?1 ORDER BY id",
    )
    .bind(batch_spec_id)
    .fetch_all(conn)
    .await?;

    Ok(rows)
}

/// Replace the workspace's linked changeset spec ids with `ids`.
pub async fn set_changeset_spec_ids(
    conn: &mut SqliteConnection,
    id: i64,
    ids: &[i64],
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE batch_spec_workspaces SET changeset_spec_ids = ?1, updated_at = ?2 WHERE id = ?3",
    )
    .bind(Json(ids))
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("workspace", id));
    }
    Ok(())
}

/// Flag ignored or unsupported workspaces the batch spec does not allow as
/// skipped. Returns the number of workspaces newly flagged.
pub async fn mark_skipped_workspaces(
    conn: &mut SqliteConnection,
    batch_spec_id: i64,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE batch_spec_workspaces
        SET skipped = TRUE, updated_at = ?2
        WHERE batch_spec_id = ?1
          AND NOT skipped
          AND EXISTS (
              SELECT 1 FROM batch_specs bs
              WHERE bs.id = batch_spec_workspaces.batch_spec_id
                AND ((batch_spec_workspaces.ignored AND NOT bs.allow_ignored)
                  OR (batch_spec_workspaces.unsupported AND NOT bs.allow_unsupported))
          )
        "#,
    )
    .bind(batch_spec_id)
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}
