use crate::error::{QueueError, Result};
use crate::jobs::executor::CommandExecutor;
use crate::jobs::manager::JobManager;
use crate::jobs::model::Job;
use crate::jobs::outcome::AttemptReport;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Attempts at persisting an outcome before giving up on it.
const RECORD_ATTEMPTS: u32 = 5;
const RECORD_BACKOFF: Duration = Duration::from_millis(200);

/// Counters for one run of the loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// One worker: claim, execute, record, repeat, until asked to stop.
pub struct Worker {
    id: String,
    manager: JobManager,
    executor: CommandExecutor,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(id: impl Into<String>, manager: JobManager) -> Self {
        let poll_interval = manager.settings().poll_interval();
        Self {
            id: id.into(),
            manager,
            executor: CommandExecutor::default(),
            poll_interval,
        }
    }

    pub fn with_executor(mut self, executor: CommandExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// The token is checked once per cycle, never while a command runs: a
    /// stop request lets the current attempt finish and be recorded, then the
    /// loop returns before claiming again.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerSummary {
        info!(worker_id = %self.id, poll_interval_ms = self.poll_interval.as_millis() as u64, "worker started");

        let mut summary = WorkerSummary::default();

        while !shutdown.is_cancelled() {
            match self.manager.claim_next(&self.id).await {
                Ok(Some(job)) => {
                    let report = self.process(&job).await;
                    summary.processed += 1;
                    if report.outcome.is_success() {
                        summary.succeeded += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
                Ok(None) => self.idle(&shutdown).await,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "claim failed");
                    self.idle(&shutdown).await;
                }
            }
        }

        info!(
            worker_id = %self.id,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "worker stopped"
        );
        summary
    }

    /// Claim and process at most one job. Returns `None` when nothing was eligible.
    pub async fn run_once(&self) -> Result<Option<AttemptReport>> {
        match self.manager.claim_next(&self.id).await? {
            Some(job) => Ok(Some(self.process(&job).await)),
            None => Ok(None),
        }
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    async fn process(&self, job: &Job) -> AttemptReport {
        info!(
            worker_id = %self.id,
            job_id = %job.id,
            attempt = job.attempts + 1,
            timeout_secs = job.timeout,
            "processing job"
        );

        let timeout = Duration::from_secs(job.timeout.max(1) as u64);
        let report = match self.executor.spawn(&job.command) {
            Ok(running) => {
                if let Some(pgid) = running.pgid() {
                    if let Err(e) = self.manager.track_command(&job.id, &self.id, pgid).await {
                        warn!(worker_id = %self.id, job_id = %job.id, error = %e, "could not record command process group");
                    }
                }
                running.wait(timeout).await
            }
            Err(report) => report,
        };

        self.record(job, &report).await;
        report
    }

    /// Persist the outcome, retrying transient storage errors so the row does
    /// not stay `processing` after the command has finished.
    async fn record(&self, job: &Job, report: &AttemptReport) {
        for attempt in 1..=RECORD_ATTEMPTS {
            match self.manager.record_result(job, &self.id, report).await {
                Ok(_) => return,
                Err(QueueError::Conflict(msg)) => {
                    warn!(worker_id = %self.id, job_id = %job.id, %msg, "job no longer held; result dropped");
                    return;
                }
                Err(e) if attempt < RECORD_ATTEMPTS => {
                    warn!(worker_id = %self.id, job_id = %job.id, attempt, error = %e, "recording result failed, retrying");
                    tokio::time::sleep(RECORD_BACKOFF * attempt).await;
                }
                Err(e) => {
                    error!(worker_id = %self.id, job_id = %job.id, error = %e, "giving up on recording result");
                }
            }
        }
    }
}
