use crate::config::Settings;
use crate::error::{QueueError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub priority: i64,
    /// Seconds.
    pub timeout: i64,

    pub run_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    /// Process group of the running command, while `processing`.
    pub command_pgid: Option<i64>,

    pub last_output: Option<String>,
    pub last_error: Option<String>,
    pub duration_ms: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Failed,
    Dead,
    Completed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
            JobState::Completed => "completed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .into_iter()
            .find(|st| st.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| QueueError::InvalidState(s.to_string()))
    }
}

/// Submission payload as produced by callers. Every field is optional here so
/// that a missing `id`/`command` surfaces as `InvalidJob` rather than a
/// deserialisation error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSubmission {
    pub id: Option<String>,
    pub command: Option<String>,
    pub max_retries: Option<i64>,
    pub priority: Option<i64>,
    pub timeout: Option<i64>,
    pub run_at: Option<DateTime<Utc>>,
}

impl JobSubmission {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            command: Some(command.into()),
            ..Self::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| QueueError::InvalidJob(format!("invalid JSON: {e}")))
    }

    pub fn max_retries(mut self, n: i64) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn priority(mut self, p: i64) -> Self {
        self.priority = Some(p);
        self
    }

    pub fn timeout(mut self, secs: i64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    /// Validate and fill defaults from `settings`.
    pub fn validate(self, settings: &Settings) -> Result<NewJob> {
        let id = self
            .id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| QueueError::InvalidJob("job must have a non-empty 'id'".into()))?;

        let command = self
            .command
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| QueueError::InvalidJob("job must have a non-empty 'command'".into()))?;

        let max_retries = self.max_retries.unwrap_or(settings.max_retries);
        if max_retries < 0 {
            return Err(QueueError::InvalidJob("'max_retries' must be >= 0".into()));
        }

        let timeout = self.timeout.unwrap_or(settings.default_timeout);
        if timeout <= 0 {
            return Err(QueueError::InvalidJob("'timeout' must be > 0".into()));
        }

        Ok(NewJob {
            id,
            command,
            max_retries,
            priority: self.priority.unwrap_or(0),
            timeout,
            run_at: self.run_at,
        })
    }
}

/// A validated job, ready to insert.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub command: String,
    pub max_retries: i64,
    pub priority: i64,
    pub timeout: i64,
    pub run_at: Option<DateTime<Utc>>,
}

/// Row counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
}

impl JobStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }

    pub fn get(&self, state: JobState) -> i64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }
}
