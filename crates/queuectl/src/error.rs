use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job with id '{0}' already exists")]
    DuplicateId(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional update matched no row: the job is no longer held by the caller.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
