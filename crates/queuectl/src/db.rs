use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// Open (creating if needed) the job database at `path`.
///
/// WAL lets readers proceed while one worker holds the write lock; the busy
/// timeout makes concurrent writers from other processes wait for the lock
/// instead of failing with `SQLITE_BUSY`.
pub async fn make_pool(path: &Path) -> Result<SqlitePool> {
    let max_connections = std::env::var("QUEUECTL_DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(4)
        .clamp(1, 32);

    let busy_timeout_secs = std::env::var("QUEUECTL_DB_BUSY_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30)
        .clamp(1, 300);

    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(busy_timeout_secs));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(busy_timeout_secs))
        .connect_with(opts)
        .await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Pool with the schema applied. This is the startup path of every binary; a
/// failure here is fatal to the process.
pub async fn open(path: &Path) -> Result<SqlitePool> {
    let pool = make_pool(path).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}
