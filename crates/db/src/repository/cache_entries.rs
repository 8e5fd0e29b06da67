//! Execution cache repository functions.
//!
//! Entries are content addressed: `(user_id, key, version)` is unique and the
//! stored value is never rewritten. Writing an existing key only refreshes
//! `last_used_at`.

use chrono::Utc;
use sqlx::SqliteConnection;

use super::json_list;
use crate::{
    models::{CacheEntryRow, NewCacheEntry},
    DbError,
};

/// Insert the entry if absent, otherwise touch its `last_used_at`.
pub async fn upsert_cache_entry(
    conn: &mut SqliteConnection,
    entry: &NewCacheEntry,
) -> Result<CacheEntryRow, DbError> {
    let row = sqlx::query_as::<_, CacheEntryRow>(
        r#"
        INSERT INTO execution_cache_entries (user_id, key, value, version, created_at, last_used_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?5)
        ON CONFLICT (user_id, key, version) DO UPDATE SET last_used_at = excluded.last_used_at
        RETURNING *
        "#,
    )
    .bind(entry.user_id)
    .bind(&entry.key)
    .bind(&entry.value)
    .bind(entry.version)
    .bind(Utc::now())
    .fetch_one(conn)
    .await?;

    Ok(row)
}

pub async fn get_cache_entry(
    conn: &mut SqliteConnection,
    user_id: i64,
    key: &str,
    version: i64,
) -> Result<Option<CacheEntryRow>, DbError> {
    let row = sqlx::query_as::<_, CacheEntryRow>(
        "SELECT * FROM execution_cache_entries WHERE user_id = ?1 AND key = ?2 AND version = ?3",
    )
    .bind(user_id)
    .bind(key)
    .bind(version)
    .fetch_optional(conn)
    .await?;

    Ok(row)
}

/// All of the user's entries for the given keys at `version`, ordered by id.
pub async fn list_cache_entries(
    conn: &mut SqliteConnection,
    user_id: i64,
    keys: &[String],
    version: i64,
) -> Result<Vec<CacheEntryRow>, DbError> {
    let Some(keys) = json_list(keys)? else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query_as::<_, CacheEntryRow>(
        r#"
        SELECT * FROM execution_cache_entries
        WHERE user_id = ?1 AND version = ?2 AND key IN (SELECT value FROM json_each(?3))
        ORDER BY id
        "#,
    )
    .bind(user_id)
    .bind(version)
    .bind(keys)
    .fetch_all(conn)
    .await?;

    Ok(rows)
}

pub async fn count_cache_entries(conn: &mut SqliteConnection, user_id: i64) -> Result<i64, DbError> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM execution_cache_entries WHERE user_id = ?1")
        .bind(user_id)
        .fetch_one(conn)
        .await?;
    Ok(count)
}

/// Record a cache hit on the given keys.
pub async fn mark_used(
    conn: &mut SqliteConnection,
    user_id: i64,
    keys: &[String],
    version: i64,
) -> Result<u64, DbError> {
    let Some(keys) = json_list(keys)? else {
        return Ok(0);
    };

    let result = sqlx::query(
        r#"
        UPDATE execution_cache_entries SET last_used_at = ?1
        WHERE user_id = ?2 AND version = ?3 AND key IN (SELECT value FROM json_each(?4))
        "#,
    )
    .bind(Utc::now())
    .bind(user_id)
    .bind(version)
    .bind(keys)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}
