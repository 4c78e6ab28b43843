use queuectl::config::{Config, Settings};
use queuectl::db;
use queuectl::jobs::{JobManager, JobState, JobSubmission, JobsRepo};
use queuectl::supervisor::{WorkerLauncher, WorkerPool, WorkerRegistry};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

async fn manager_for(home: &Path) -> JobManager {
    let cfg = Config::with_home(home);
    cfg.ensure_dirs().unwrap();
    let pool = db::open(&cfg.database_path).await.unwrap();
    JobManager::new(JobsRepo::new(pool), Settings::default())
}

fn worker_cmd(home: &Path, worker_id: &str) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_queuectl-worker"));
    cmd.arg("--worker-id")
        .arg(worker_id)
        .env("QUEUECTL_HOME", home)
        .env_remove("QUEUECTL_DB_PATH")
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

fn send_sigterm(child: &Child) {
    let sent = Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .status()
        .unwrap();
    assert!(sent.success());
}

async fn wait_for_exit(child: &mut Child) -> ExitStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        assert!(Instant::now() < deadline, "worker did not exit");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_until_processing(manager: &JobManager, id: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while manager.get_job(id).await.unwrap().state != JobState::Processing {
        assert!(Instant::now() < deadline, "job '{id}' never claimed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn worker_binary_drains_the_queue() {
    let home = tempfile::tempdir().unwrap();
    let manager = manager_for(home.path()).await;

    manager
        .enqueue(JobSubmission::new("ok", "echo done"))
        .await
        .unwrap();
    manager
        .enqueue(JobSubmission::new("broken", "exit 2").max_retries(1))
        .await
        .unwrap();

    let status = worker_cmd(home.path(), "worker-e2e")
        .arg("--exit-when-idle")
        .status()
        .unwrap();
    assert!(status.success());

    let ok = manager.get_job("ok").await.unwrap();
    assert_eq!(ok.state, JobState::Completed);
    assert_eq!(ok.last_output.as_deref(), Some("done"));

    let broken = manager.get_job("broken").await.unwrap();
    assert_eq!(broken.state, JobState::Dead);
    assert_eq!(broken.last_error.as_deref(), Some("exit status 2"));
}

#[tokio::test]
async fn sigterm_lets_the_current_job_finish() {
    let home = tempfile::tempdir().unwrap();
    let manager = manager_for(home.path()).await;

    manager
        .enqueue(JobSubmission::new("long", "sleep 1; echo survived"))
        .await
        .unwrap();

    let mut child = worker_cmd(home.path(), "worker-term").spawn().unwrap();
    wait_until_processing(&manager, "long").await;
    send_sigterm(&child);

    let status = wait_for_exit(&mut child).await;
    assert!(status.success(), "{status:?}");

    let job = manager.get_job("long").await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.last_output.as_deref(), Some("survived"));
}

#[tokio::test]
async fn sigterm_stops_an_exit_when_idle_run_after_the_current_job() {
    let home = tempfile::tempdir().unwrap();
    let manager = manager_for(home.path()).await;

    manager
        .enqueue(JobSubmission::new("long", "sleep 1; echo survived").priority(1))
        .await
        .unwrap();
    manager
        .enqueue(JobSubmission::new("next", "true"))
        .await
        .unwrap();

    let mut child = worker_cmd(home.path(), "worker-drain-term")
        .arg("--exit-when-idle")
        .spawn()
        .unwrap();
    wait_until_processing(&manager, "long").await;
    send_sigterm(&child);

    let status = wait_for_exit(&mut child).await;
    assert!(status.success(), "{status:?}");

    let long = manager.get_job("long").await.unwrap();
    assert_eq!(long.state, JobState::Completed);
    assert_eq!(long.last_output.as_deref(), Some("survived"));

    let next = manager.get_job("next").await.unwrap();
    assert_eq!(next.state, JobState::Pending);
}

#[tokio::test]
async fn force_killed_worker_leaves_no_command_running() {
    let home = tempfile::tempdir().unwrap();
    let manager = manager_for(home.path()).await;
    let marker = home.path().join("marker");

    manager
        .enqueue(
            JobSubmission::new("slow", format!("sleep 3; touch '{}'", marker.display()))
                .timeout(60),
        )
        .await
        .unwrap();

    let launcher = WorkerLauncher::new(env!("CARGO_BIN_EXE_queuectl-worker"))
        .env("QUEUECTL_HOME", home.path())
        .log_dir(home.path().join("logs"));
    let pool = WorkerPool::new(
        WorkerRegistry::new(home.path().join("workers.json")),
        launcher,
        manager.clone(),
    )
    .with_grace(Duration::from_millis(300));
    pool.start(1).unwrap();

    // the worker finishes jobs on SIGTERM, so a 3s job outlasts the grace
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let job = manager.get_job("slow").await.unwrap();
        if job.state == JobState::Processing && job.command_pgid.is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "job never started: {job:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let report = pool.stop().await.unwrap();
    assert_eq!(report.killed.len(), 1, "{report:?}");
    assert_eq!(report.orphaned_jobs, vec!["slow".to_string()]);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!marker.exists(), "job command kept running after its worker was killed");

    let job = manager.get_job("slow").await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.as_deref(), Some("worker lost"));
    assert_eq!(job.command_pgid, None);
}
