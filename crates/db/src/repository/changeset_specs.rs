//! Changeset spec repository functions.

use chrono::Utc;
use sqlx::types::Json;
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::json_list;
use crate::{
    models::{ChangesetSpecRow, NewChangesetSpec},
    DbError,
};

/// Insert a changeset spec with a freshly generated `rand_id`.
pub async fn insert_changeset_spec(
    conn: &mut SqliteConnection,
    spec: &NewChangesetSpec,
) -> Result<ChangesetSpecRow, DbError> {
    let row = sqlx::query_as::<_, ChangesetSpecRow>(
        r#"
        INSERT INTO changeset_specs
            (rand_id, batch_spec_id, repo_id, user_id, base_ref, base_rev, head_ref, title, body,
             commit_message, commit_author_name, commit_author_email, published, diff,
             diff_stat_added, diff_stat_deleted, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(spec.batch_spec_id)
    .bind(spec.repo_id)
    .bind(spec.user_id)
    .bind(&spec.base_ref)
    .bind(&spec.base_rev)
    .bind(&spec.head_ref)
    .bind(&spec.title)
    .bind(&spec.body)
    .bind(&spec.commit_message)
    .bind(&spec.commit_author_name)
    .bind(&spec.commit_author_email)
    .bind(spec.published.as_ref().map(Json))
    .bind(&spec.diff)
    .bind(spec.diff_stat_added)
    .bind(spec.diff_stat_deleted)
    .bind(Utc::now())
    .fetch_one(conn)
    .await?;

    Ok(row)
}

pub async fn list_changeset_specs(
    conn: &mut SqliteConnection,
    batch_spec_id: i64,
) -> Result<Vec<ChangesetSpecRow>, DbError> {
    let rows = sqlx::query_as::<_, ChangesetSpecRow>(
        "SELECT * FROM changeset_specs WHERE batch_spec_id = ?1 ORDER BY id",
    )
    .bind(batch_spec_id)
    .fetch_all(conn)
    .await?;

    Ok(rows)
}

pub async fn delete_changeset_specs(conn: &mut SqliteConnection, ids: &[i64]) -> Result<u64, DbError> {
    let Some(ids) = json_list(ids)? else {
        return Ok(0);
    };

    let result = sqlx::query("DELETE FROM changeset_specs WHERE id IN (SELECT value FROM json_each(?1))")
        .bind(ids)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}
