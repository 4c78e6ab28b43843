pub mod dlq;
pub mod executor;
pub mod manager;
pub mod model;
pub mod outcome;
pub mod repo;
pub mod retry;
pub mod worker;

pub use dlq::DeadLetterQueue;
pub use executor::{CommandExecutor, RunningCommand};
pub use manager::JobManager;
pub use model::{Job, JobState, JobStats, JobSubmission, NewJob};
pub use outcome::{AttemptReport, FailureReason, Outcome, Transition};
pub use repo::JobsRepo;
pub use retry::RetryConfig;
pub use worker::{Worker, WorkerSummary};
