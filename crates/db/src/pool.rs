//! SQLite connection pool.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::DbError;

/// Type alias for the shared pool used across the whole application.
pub type DbPool = SqlitePool;

/// How long a connection waits for another writer's lock before `SQLITE_BUSY`.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a new connection pool from the given `database_url`.
///
/// `max_connections` controls the pool ceiling. The database file is created
/// when missing and runs in WAL mode so readers never block the writer.
///
/// sqlx opens every transaction with a deferred `BEGIN`. A transaction that
/// reads before it writes cannot wait for a concurrent writer when it later
/// upgrades its lock, so multi-statement write transactions in this crate
/// start with their first write (see `jobs::lock_processing_job`). That write
/// takes the lock under the busy timeout, like `BEGIN IMMEDIATE` would.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    create_pool_with_busy_timeout(database_url, max_connections, DEFAULT_BUSY_TIMEOUT).await
}

pub async fn create_pool_with_busy_timeout(
    database_url: &str,
    max_connections: u32,
    busy_timeout: Duration,
) -> Result<DbPool, DbError> {
    info!("Connecting to database (max_connections={}, busy_timeout={:?})", max_connections, busy_timeout);
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(busy_timeout);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Private in-memory database with the schema applied.
///
/// A single connection that never expires, since closing it drops the data.
pub async fn create_in_memory_pool() -> Result<DbPool, DbError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations located in `./migrations` (relative to the
/// workspace root at build time).
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("Running database migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
