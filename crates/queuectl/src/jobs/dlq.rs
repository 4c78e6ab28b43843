use crate::error::{QueueError, Result};
use crate::jobs::manager::JobManager;
use crate::jobs::model::{Job, JobState};

/// Dead letter queue: the `dead` rows, and the one way out of them.
#[derive(Clone)]
pub struct DeadLetterQueue {
    manager: JobManager,
}

impl DeadLetterQueue {
    pub fn new(manager: JobManager) -> Self {
        Self { manager }
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        self.manager.list_jobs(Some(JobState::Dead), None).await
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        match self.manager.get_job(id).await? {
            job if job.state == JobState::Dead => Ok(job),
            _ => Err(QueueError::NotFound(format!("no dead job with id '{id}'"))),
        }
    }

    pub async fn retry(&self, id: &str) -> Result<Job> {
        self.manager.retry_dead_job(id).await
    }
}
