//! Worker pool supervision: launching detached worker processes, reporting on
//! them, and stopping them.

pub mod process;
pub mod registry;

pub use registry::{WorkerRecord, WorkerRegistry};

use crate::error::{QueueError, Result};
use crate::jobs::manager::JobManager;
use chrono::Utc;
use process::ProcessState;
use serde::Serialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const STOP_POLL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// A job command starts right after its job is claimed. A process group
/// leader whose start time falls outside this window around the claim is a
/// reused PID, not the job's command.
const COMMAND_START_WINDOW_SECS: i64 = 10;

/// What a registry record corresponds to right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// The PID is alive and has the start time recorded at launch.
    Running,
    Exited,
    /// The PID is alive but belongs to some other process.
    Stale,
    /// The PID is alive but the record has no start time to check it against.
    Unknown,
}

impl Liveness {
    /// Whether `worker stop` may signal this PID.
    pub fn is_signalable(self) -> bool {
        matches!(self, Liveness::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Running => "running",
            Liveness::Exited => "exited",
            Liveness::Stale => "stale",
            Liveness::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    #[serde(flatten)]
    pub record: WorkerRecord,
    pub liveness: Liveness,
}

/// Result of `WorkerPool::stop`, by worker id.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StopReport {
    pub stopped: Vec<String>,
    pub killed: Vec<String>,
    pub already_exited: Vec<String>,
    /// Not signalled: the PID was reused, or could not be confirmed as ours.
    pub stale: Vec<String>,
    /// Jobs that were still `processing` under a stopped worker.
    pub orphaned_jobs: Vec<String>,
}

impl StopReport {
    pub fn total(&self) -> usize {
        self.stopped.len() + self.killed.len() + self.already_exited.len() + self.stale.len()
    }
}

/// How to start one worker process. The worker id is appended as
/// `--worker-id <id>` after the configured arguments.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    log_dir: Option<PathBuf>,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            log_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Send each worker's stdout and stderr to `<dir>/<worker_id>.log`
    /// instead of discarding them.
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    fn spawn(&self, worker_id: &str) -> Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--worker-id")
            .arg(worker_id)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null());

        match &self.log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let log = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(format!("{worker_id}.log")))?;
                cmd.stdout(log.try_clone()?).stderr(log);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        // own process group: a Ctrl-C at the terminal that ran `worker start`
        // must not reach the workers
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd.spawn().map_err(|e| {
            QueueError::Config(format!(
                "failed to launch worker program {}: {e}",
                self.program.display()
            ))
        })
    }
}

/// Starts, inspects and stops the worker processes listed in the registry.
pub struct WorkerPool {
    registry: WorkerRegistry,
    launcher: WorkerLauncher,
    manager: JobManager,
    grace: Duration,
    // children started by this instance, kept so they can be reaped
    children: Mutex<HashMap<u32, Child>>,
}

impl WorkerPool {
    pub fn new(registry: WorkerRegistry, launcher: WorkerLauncher, manager: JobManager) -> Self {
        Self {
            registry,
            launcher,
            manager,
            grace: Duration::from_secs(30),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Launch `count` detached workers and add them to the registry.
    ///
    /// Workers already in the registry are kept. If a launch fails, the ones
    /// started before it are still recorded so `stop` can find them.
    pub fn start(&self, count: usize) -> Result<Vec<WorkerRecord>> {
        if count == 0 {
            return Err(QueueError::Config("worker count must be at least 1".into()));
        }

        let mut records = self.registry.load()?;
        let mut started = Vec::with_capacity(count);
        let mut failure = None;

        for _ in 0..count {
            let worker_id = new_worker_id();
            match self.launcher.spawn(&worker_id) {
                Ok(child) => {
                    let pid = child.id();
                    let record = WorkerRecord {
                        worker_id,
                        pid,
                        start_time: process::start_time(pid),
                        started_at: Utc::now(),
                    };
                    info!(worker_id = %record.worker_id, pid, "worker launched");
                    self.track(child);
                    started.push(record);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        records.extend(started.iter().cloned());
        self.registry.save(&records)?;

        match failure {
            Some(e) => Err(e),
            None => Ok(started),
        }
    }

    /// Liveness of every registered worker. Never signals anything.
    pub fn status(&self) -> Result<Vec<WorkerStatus>> {
        Ok(self
            .registry
            .load()?
            .into_iter()
            .map(|record| {
                let liveness = self.liveness(&record);
                WorkerStatus { record, liveness }
            })
            .collect())
    }

    /// Stop every registered worker and clear the registry.
    ///
    /// Each live worker gets SIGTERM and up to the grace period to finish its
    /// current job; survivors get SIGKILL. Records whose PID cannot be
    /// confirmed as the worker we started are never signalled, and a live PID
    /// without a recorded start time keeps its jobs. Afterwards any other job
    /// still `processing` under one of these workers has its command's
    /// process group killed and is failed as "worker lost".
    pub async fn stop(&self) -> Result<StopReport> {
        let records = self.registry.load()?;
        let mut report = StopReport::default();
        let mut signalled = Vec::new();
        let mut unverified = Vec::new();

        for record in &records {
            match self.liveness(record) {
                Liveness::Exited => report.already_exited.push(record.worker_id.clone()),
                Liveness::Stale => {
                    warn!(
                        worker_id = %record.worker_id,
                        pid = record.pid,
                        "pid now belongs to another process, not signalling"
                    );
                    report.stale.push(record.worker_id.clone());
                }
                Liveness::Unknown => {
                    warn!(
                        worker_id = %record.worker_id,
                        pid = record.pid,
                        "no recorded start time for pid, not signalling"
                    );
                    report.stale.push(record.worker_id.clone());
                    unverified.push(record.worker_id.as_str());
                }
                Liveness::Running => match process::terminate(record.pid) {
                    Ok(()) => {
                        debug!(worker_id = %record.worker_id, pid = record.pid, "sent SIGTERM");
                        signalled.push(record);
                    }
                    Err(e) => {
                        debug!(worker_id = %record.worker_id, pid = record.pid, error = %e, "SIGTERM failed");
                        report.already_exited.push(record.worker_id.clone());
                    }
                },
            }
        }

        let deadline = Instant::now() + self.grace;
        let mut remaining = signalled;
        loop {
            let (gone, alive): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .partition(|r| !self.liveness(r).is_signalable());
            report
                .stopped
                .extend(gone.into_iter().map(|r| r.worker_id.clone()));
            remaining = alive;

            if remaining.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(STOP_POLL).await;
        }

        for record in &remaining {
            warn!(
                worker_id = %record.worker_id,
                pid = record.pid,
                grace_secs = self.grace.as_secs(),
                "worker did not exit within grace period, sending SIGKILL"
            );
            if let Err(e) = process::kill(record.pid) {
                debug!(worker_id = %record.worker_id, error = %e, "SIGKILL failed");
            }
            report.killed.push(record.worker_id.clone());
        }
        self.wait_gone(&remaining).await;

        for record in &records {
            // may still be alive and working its jobs
            if unverified.contains(&record.worker_id.as_str()) {
                continue;
            }
            self.kill_orphaned_commands(&record.worker_id).await?;
            for job in self.manager.fail_orphaned(&record.worker_id).await? {
                warn!(job_id = %job.id, worker_id = %record.worker_id, state = %job.state, "orphaned job resolved");
                report.orphaned_jobs.push(job.id);
            }
        }

        self.registry.clear()?;

        info!(
            stopped = report.stopped.len(),
            killed = report.killed.len(),
            already_exited = report.already_exited.len(),
            stale = report.stale.len(),
            orphaned_jobs = report.orphaned_jobs.len(),
            "worker pool stopped"
        );
        Ok(report)
    }

    fn liveness(&self, record: &WorkerRecord) -> Liveness {
        if self.reap(record.pid) {
            return Liveness::Exited;
        }
        match process::inspect(record.pid) {
            ProcessState::Gone => Liveness::Exited,
            ProcessState::Alive { start_time } => match record.start_time {
                // start times are whole seconds derived from boot time
                Some(then) if then.abs_diff(start_time) <= 1 => Liveness::Running,
                Some(_) => Liveness::Stale,
                None => Liveness::Unknown,
            },
        }
    }

    /// SIGKILL the process group of every command still running for a job
    /// held by `worker_id`. A worker killed mid-job cannot clean these up
    /// itself, and once the job is failed it may be claimed again.
    async fn kill_orphaned_commands(&self, worker_id: &str) -> Result<()> {
        for job in self.manager.jobs_held_by(worker_id).await? {
            let Some(pgid) = job.command_pgid.and_then(|p| u32::try_from(p).ok()) else {
                continue;
            };

            // leader gone: the group id cannot have been reused while members remain
            if let ProcessState::Alive { start_time } = process::inspect(pgid) {
                let claimed = job.updated_at.timestamp();
                let started = i64::try_from(start_time).unwrap_or(i64::MAX);
                if !(claimed - COMMAND_START_WINDOW_SECS..=claimed + COMMAND_START_WINDOW_SECS)
                    .contains(&started)
                {
                    warn!(job_id = %job.id, pgid, "command pid was reused, not signalling");
                    continue;
                }
            }

            match process::kill_group(pgid) {
                Ok(()) => warn!(job_id = %job.id, worker_id, pgid, "killed command left running by stopped worker"),
                Err(e) => debug!(job_id = %job.id, pgid, error = %e, "command group already gone"),
            }
        }
        Ok(())
    }

    async fn wait_gone(&self, records: &[&WorkerRecord]) {
        let deadline = Instant::now() + KILL_WAIT;
        while records.iter().any(|r| self.liveness(r).is_signalable()) {
            if Instant::now() >= deadline {
                warn!("killed workers still visible after {}s", KILL_WAIT.as_secs());
                return;
            }
            tokio::time::sleep(STOP_POLL).await;
        }
    }

    fn track(&self, child: Child) {
        if let Ok(mut children) = self.children.lock() {
            children.insert(child.id(), child);
        }
    }

    /// True when `pid` is a child of this process that has exited (and is now reaped).
    fn reap(&self, pid: u32) -> bool {
        let Ok(mut children) = self.children.lock() else {
            return false;
        };
        let exited = match children.get_mut(&pid) {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => return false,
        };
        if exited {
            children.remove(&pid);
        }
        exited
    }
}

fn new_worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", std::process::id(), &suffix[..8])
}
