use queuectl::config::Settings;
use queuectl::db;
use queuectl::jobs::{Job, JobManager, JobSubmission, JobsRepo};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// A fresh database file in its own temp dir. Keep the `TestDb` alive for as
/// long as the pool is used.
pub struct TestDb {
    pub dir: TempDir,
    pub pool: SqlitePool,
}

impl TestDb {
    #[allow(dead_code)]
    pub fn path(&self) -> std::path::PathBuf {
        self.dir.path().join("jobs.db")
    }
}

pub async fn setup_db() -> TestDb {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let pool = db::open(&dir.path().join("jobs.db"))
        .await
        .expect("failed to open test database");
    TestDb { dir, pool }
}

/// Defaults with a short poll interval so worker loops react quickly.
#[allow(dead_code)]
pub fn test_settings() -> Settings {
    Settings {
        poll_interval: 0.05,
        ..Settings::default()
    }
}

#[allow(dead_code)]
pub fn manager(db: &TestDb) -> JobManager {
    JobManager::new(JobsRepo::new(db.pool.clone()), test_settings())
}

#[allow(dead_code)]
pub async fn insert_job(manager: &JobManager, id: &str, command: &str) -> Job {
    manager
        .enqueue(JobSubmission::new(id, command))
        .await
        .expect("failed to enqueue job")
}

/// Make a `failed` job due now, instead of waiting out its backoff.
#[allow(dead_code)]
pub async fn make_due(pool: &SqlitePool, id: &str) {
    sqlx::query("UPDATE jobs SET next_retry_at = $1 WHERE id = $2 AND state = 'failed'")
        .bind(chrono::Utc::now() - chrono::Duration::seconds(1))
        .bind(id)
        .execute(pool)
        .await
        .expect("failed to reschedule job");
}
