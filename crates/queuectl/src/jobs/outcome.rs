use crate::jobs::model::JobState;
use chrono::{DateTime, Utc};
use std::fmt;

/// Why an attempt failed. The `Display` form is what lands in `last_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    ExitStatus(i32),
    Signal(i32),
    LaunchFailed(String),
    /// The owning worker was force-terminated while the attempt was running.
    WorkerLost,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::ExitStatus(_) => "EXIT_STATUS",
            Self::Signal(_) => "SIGNAL",
            Self::LaunchFailed(_) => "LAUNCH_FAILED",
            Self::WorkerLost => "WORKER_LOST",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::ExitStatus(code) => write!(f, "exit status {code}"),
            Self::Signal(sig) => write!(f, "killed by signal {sig}"),
            Self::LaunchFailed(msg) => write!(f, "launch failed: {msg}"),
            Self::WorkerLost => f.write_str("worker lost"),
        }
    }
}

/// Operator hint for a persisted `last_error`, shown next to DLQ entries.
pub fn suggested_action(last_error: &str) -> &'static str {
    if last_error == "timeout" {
        "Raise the job timeout or make the command finish faster."
    } else if last_error.starts_with("exit status") {
        "Inspect last_output; the command itself reported failure."
    } else if last_error.starts_with("killed by signal") {
        "Something outside the queue killed the command (OOM killer, operator)."
    } else if last_error.starts_with("launch failed") {
        "The shell could not be started; check PATH and permissions on the worker host."
    } else if last_error == "worker lost" {
        "The worker was force-stopped mid-attempt; raise the stop grace period."
    } else {
        "Inspect last_output and worker logs."
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(FailureReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

/// What one execution attempt produced.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub outcome: Outcome,
    /// Combined stdout + stderr, possibly truncated.
    pub output: String,
    pub duration_ms: i64,
}

impl AttemptReport {
    pub fn error(&self) -> Option<String> {
        match &self.outcome {
            Outcome::Succeeded => None,
            Outcome::Failed(reason) => Some(reason.to_string()),
        }
    }
}

/// The state change a finished attempt causes. Computed by the manager,
/// applied by the store in one conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Complete,
    Retry {
        attempts: i64,
        next_retry_at: DateTime<Utc>,
    },
    Dead {
        attempts: i64,
    },
}

impl Transition {
    pub fn state(&self) -> JobState {
        match self {
            Transition::Complete => JobState::Completed,
            Transition::Retry { .. } => JobState::Failed,
            Transition::Dead { .. } => JobState::Dead,
        }
    }
}
