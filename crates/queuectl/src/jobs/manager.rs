use crate::config::Settings;
use crate::error::{QueueError, Result};
use crate::jobs::{
    model::{Job, JobState, JobStats, JobSubmission},
    outcome::{AttemptReport, FailureReason, Outcome, Transition},
    repo::JobsRepo,
    retry::{self, RetryConfig},
};
use chrono::Utc;
use tracing::{debug, info, warn};

/// Owns the job state machine. Every transition goes through here; the repo
/// only applies what the manager decided.
#[derive(Clone)]
pub struct JobManager {
    jobs: JobsRepo,
    settings: Settings,
    retry_cfg: RetryConfig,
}

impl JobManager {
    pub fn new(jobs: JobsRepo, settings: Settings) -> Self {
        let retry_cfg = RetryConfig {
            backoff_base: settings.backoff_base,
        };
        Self {
            jobs,
            settings,
            retry_cfg,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn enqueue(&self, submission: JobSubmission) -> Result<Job> {
        let new_job = submission.validate(&self.settings)?;
        let job = self.jobs.enqueue(&new_job, Utc::now()).await?;

        info!(
            job_id = %job.id,
            priority = job.priority,
            max_retries = job.max_retries,
            timeout = job.timeout,
            run_at = ?job.run_at,
            "job enqueued"
        );
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.jobs
            .get_job(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("no job with id '{id}'")))
    }

    pub async fn list_jobs(&self, state: Option<JobState>, limit: Option<i64>) -> Result<Vec<Job>> {
        match state {
            Some(state) => self.jobs.list_by_state(state, limit).await,
            None => self.jobs.list_jobs(limit).await,
        }
    }

    pub async fn stats(&self) -> Result<JobStats> {
        self.jobs.stats().await
    }

    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        self.jobs.claim_next(worker_id, Utc::now()).await
    }

    /// Note the process group of the command now running for a job held by
    /// `worker_id`, so `worker stop` can kill it if the worker dies.
    pub async fn track_command(&self, job_id: &str, worker_id: &str, pgid: u32) -> Result<()> {
        self.jobs
            .set_command_pgid(job_id, worker_id, i64::from(pgid))
            .await?;
        debug!(job_id, worker_id, pgid, "command started");
        Ok(())
    }

    /// Jobs currently `processing` under `worker_id`.
    pub async fn jobs_held_by(&self, worker_id: &str) -> Result<Vec<Job>> {
        self.jobs.list_processing_for(worker_id).await
    }

    /// Record the outcome of an attempt on `job`, which must be the row as
    /// returned by `claim_next` for `worker_id`.
    pub async fn record_result(
        &self,
        job: &Job,
        worker_id: &str,
        report: &AttemptReport,
    ) -> Result<Job> {
        match &report.outcome {
            Outcome::Succeeded => self.on_success(job, worker_id, report).await,
            Outcome::Failed(reason) => self.on_failure(job, worker_id, reason, report).await,
        }
    }

    async fn on_success(&self, job: &Job, worker_id: &str, report: &AttemptReport) -> Result<Job> {
        let updated = self
            .jobs
            .record_result(&job.id, worker_id, &Transition::Complete, report, Utc::now())
            .await?;

        info!(
            job_id = %job.id,
            worker_id,
            duration_ms = report.duration_ms,
            "job completed"
        );
        Ok(updated)
    }

    async fn on_failure(
        &self,
        job: &Job,
        worker_id: &str,
        reason: &FailureReason,
        report: &AttemptReport,
    ) -> Result<Job> {
        let now = Utc::now();
        let transition = retry::on_failure(job.attempts, job.max_retries, &self.retry_cfg, now);

        let updated = self
            .jobs
            .record_result(&job.id, worker_id, &transition, report, now)
            .await?;

        match transition {
            Transition::Retry {
                attempts,
                next_retry_at,
            } => warn!(
                job_id = %job.id,
                worker_id,
                attempts,
                max_retries = job.max_retries,
                reason = %reason,
                code = reason.code(),
                %next_retry_at,
                "job failed, retry scheduled"
            ),
            Transition::Dead { attempts } => warn!(
                job_id = %job.id,
                worker_id,
                attempts,
                max_retries = job.max_retries,
                reason = %reason,
                code = reason.code(),
                "job failed permanently, moved to DLQ"
            ),
            Transition::Complete => {}
        }

        Ok(updated)
    }

    /// Resolve every job still held by `worker_id` as a failed attempt.
    /// Used once a worker is known to be gone (force-killed or crashed), so
    /// that no row stays `processing` without a live owner.
    pub async fn fail_orphaned(&self, worker_id: &str) -> Result<Vec<Job>> {
        let held = self.jobs_held_by(worker_id).await?;
        let mut resolved = Vec::with_capacity(held.len());

        for job in held {
            let report = AttemptReport {
                outcome: Outcome::Failed(FailureReason::WorkerLost),
                output: String::new(),
                duration_ms: (Utc::now() - job.updated_at).num_milliseconds().max(0),
            };

            match self.record_result(&job, worker_id, &report).await {
                Ok(job) => resolved.push(job),
                // the worker finished it between our read and write
                Err(QueueError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(resolved)
    }

    /// `dead -> pending`, fresh retry budget.
    pub async fn retry_dead_job(&self, id: &str) -> Result<Job> {
        let job = self.jobs.reset_for_retry_from_dlq(id, Utc::now()).await?;
        info!(job_id = %job.id, "dead job re-admitted to the queue");
        Ok(job)
    }
}
