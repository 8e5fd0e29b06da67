//! Batch spec repository functions.

use chrono::Utc;
use sqlx::types::Json;
use sqlx::SqliteConnection;

use crate::{
    models::{BatchSpecRow, NewBatchSpec},
    DbError,
};

pub async fn create_batch_spec(
    conn: &mut SqliteConnection,
    spec: &NewBatchSpec,
) -> Result<BatchSpecRow, DbError> {
    let row = sqlx::query_as::<_, BatchSpecRow>(
        r#"
        INSERT INTO batch_specs (user_id, allow_unsupported, allow_ignored, changeset_template, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        RETURNING *
        "#,
    )
    .bind(spec.user_id)
    .bind(spec.allow_unsupported)
    .bind(spec.allow_ignored)
    .bind(Json(&spec.changeset_template))
    .bind(Utc::now())
    .fetch_one(conn)
    .await?;

    Ok(row)
}

pub async fn get_batch_spec(conn: &mut SqliteConnection, id: i64) -> Result<BatchSpecRow, DbError> {
    sqlx::query_as::<_, BatchSpecRow>("SELECT * FROM batch_specs WHERE id = ?1")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::not_found("batch spec", id))
}
