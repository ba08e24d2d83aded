//! Connection pool setup and schema.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

/// Default busy timeout while waiting for locks.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Open a SQLite pool with WAL mode, foreign keys, and a busy timeout.
///
/// `database_url` is a SQLite URL (e.g. `sqlite:thumbly.db?mode=rwc` or
/// `sqlite::memory:`). The database file is created if missing.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    tracing::info!(max_connections, "database pool initialized");

    Ok(pool)
}

/// Create the tables and indexes if they do not exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id            TEXT PRIMARY KEY,
            user_id       TEXT NOT NULL,
            original_name TEXT NOT NULL,
            stored_name   TEXT NOT NULL UNIQUE,
            mime_type     TEXT NOT NULL,
            size_bytes    INTEGER NOT NULL,
            path          TEXT NOT NULL,
            kind          TEXT NOT NULL,
            created_at    TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id              TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL,
            file_id         TEXT NOT NULL REFERENCES files(id),
            status          TEXT NOT NULL,
            progress        INTEGER NOT NULL DEFAULT 0,
            thumbnail_sizes TEXT NOT NULL,
            error           TEXT,
            started_at      TEXT,
            completed_at    TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_user_created ON jobs(user_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS thumbnails (
            id         TEXT PRIMARY KEY,
            job_id     TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            file_id    TEXT NOT NULL,
            size       TEXT NOT NULL,
            width      INTEGER NOT NULL,
            height     INTEGER NOT NULL,
            file_name  TEXT NOT NULL,
            path       TEXT NOT NULL,
            url_path   TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_thumbnails_job ON thumbnails(job_id)")
        .execute(pool)
        .await?;

    Ok(())
}
