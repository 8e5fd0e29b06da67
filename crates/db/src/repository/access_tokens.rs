//! Ephemeral access tokens minted for executing jobs.

use chrono::Utc;
use sqlx::SqliteConnection;

use crate::{models::AccessTokenRow, DbError};

pub async fn create_access_token(
    conn: &mut SqliteConnection,
    user_id: i64,
    note: &str,
) -> Result<AccessTokenRow, DbError> {
    let row = sqlx::query_as::<_, AccessTokenRow>(
        "INSERT INTO access_tokens (user_id, note, created_at) VALUES (?1, ?2, ?3) RETURNING *",
    )
    .bind(user_id)
    .bind(note)
    .bind(Utc::now())
    .fetch_one(conn)
    .await?;

    Ok(row)
}

pub async fn get_access_token(conn: &mut SqliteConnection, id: i64) -> Result<Option<AccessTokenRow>, DbError> {
    let row = sqlx::query_as::<_, AccessTokenRow>("SELECT * FROM access_tokens WHERE id = ?1")
        .bind(id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

/// Delete the token. Returns false if it was already gone.
pub async fn hard_delete_access_token(conn: &mut SqliteConnection, id: i64) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM access_tokens WHERE id = ?1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}
