use clap::Parser;

use queuectl::config::Config;
use queuectl::db;
use queuectl::jobs::{JobManager, JobsRepo, Worker};
use queuectl::shutdown::install_shutdown_handler;
use queuectl::telemetry;

#[derive(Parser, Debug)]
#[command(name = "queuectl-worker")]
#[command(version)]
#[command(about = "Claims and runs queued jobs until told to stop")]
struct Args {
    /// Identity recorded on every job this worker claims
    #[arg(long, env = "QUEUECTL_WORKER_ID")]
    worker_id: Option<String>,

    /// Process eligible jobs, then exit instead of polling
    #[arg(long)]
    exit_when_idle: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = Config::from_env()?;
    telemetry::init_tracing(cfg.log_format, "info");

    let worker_id = args
        .worker_id
        .unwrap_or_else(|| format!("worker-{}", std::process::id()));

    cfg.ensure_dirs()?;
    let settings = cfg.settings_store().load()?;
    let pool = db::open(&cfg.database_path).await?;

    tracing::info!(
        worker_id = %worker_id,
        pid = std::process::id(),
        db = %cfg.database_path.display(),
        max_retries = settings.max_retries,
        backoff_base = settings.backoff_base,
        poll_interval = settings.poll_interval,
        default_timeout = settings.default_timeout,
        "queuectl worker starting"
    );

    let manager = JobManager::new(JobsRepo::new(pool.clone()), settings);
    let worker = Worker::new(worker_id, manager);

    let shutdown = install_shutdown_handler();

    if args.exit_when_idle {
        // a signal lets the job in hand finish, then stops further claims
        let mut processed = 0u64;
        while !shutdown.is_cancelled() {
            match worker.run_once().await? {
                Some(_) => processed += 1,
                None => break,
            }
        }
        tracing::info!(
            worker_id = %worker.id(),
            processed,
            interrupted = shutdown.is_cancelled(),
            "exit-when-idle run finished"
        );
    } else {
        worker.run(shutdown).await;
    }

    pool.close().await;
    Ok(())
}
