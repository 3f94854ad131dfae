//! Embedded SQLite job store.
//!
//! Owns the connection pool, the schema migrations and the [`JobRepo`]
//! repository through which every job mutation flows.
//!
//! [`JobRepo`]: repositories::JobRepo

pub mod error;
pub mod models;
pub mod repositories;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

pub use error::StoreError;

pub type DbPool = sqlx::SqlitePool;

/// File name of the job database inside the storage root.
pub const DATABASE_FILE: &str = "jobs.db";

/// Maximum pooled connections. SQLite serializes writers, so a larger pool
/// only adds lock contention.
const MAX_CONNECTIONS: u32 = 8;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Open (or create) the database file at `path`.
pub async fn create_pool(path: &Path) -> Result<DbPool, sqlx::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Verify the database answers a trivial query.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
