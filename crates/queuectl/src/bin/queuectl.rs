use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use queuectl::config::Config;
use queuectl::db;
use queuectl::jobs::outcome::suggested_action;
use queuectl::jobs::{DeadLetterQueue, Job, JobManager, JobState, JobSubmission, JobsRepo};
use queuectl::supervisor::{WorkerLauncher, WorkerPool, WorkerRegistry};
use queuectl::telemetry;

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "A single-machine background job queue")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job, given as JSON inline or in a file
    Enqueue {
        /// Job JSON, e.g. '{"id":"job1","command":"echo hi"}'
        job_json: Option<String>,

        /// Read the job JSON from this file instead
        #[arg(long, short = 'f', conflicts_with = "job_json")]
        file: Option<PathBuf>,
    },

    /// List jobs, optionally filtered by state
    List {
        /// pending, processing, completed, failed or dead
        #[arg(long)]
        state: Option<JobState>,

        #[arg(long)]
        limit: Option<i64>,

        /// Print jobs as JSON
        #[arg(long)]
        json: bool,
    },

    /// Job counts per state, registered workers and current settings
    Status,

    /// Worker pool management
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Dead letter queue
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Read or change engine settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum WorkerCommands {
    /// Launch detached worker processes
    Start {
        #[arg(long, short = 'c', default_value_t = 1)]
        count: usize,
    },
    /// Stop all registered workers (SIGTERM, then SIGKILL after the grace period)
    Stop,
}

#[derive(Subcommand, Debug)]
enum DlqCommands {
    /// List dead jobs
    List,
    /// Move a dead job back to pending with a fresh retry budget
    Retry { job_id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print one setting, or all of them
    Get { key: Option<String> },
    /// Change a setting
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = Config::from_env()?;
    telemetry::init_tracing(cfg.log_format, "warn");
    cfg.ensure_dirs()
        .with_context(|| format!("cannot create {}", cfg.home.display()))?;

    // settings need no database
    let command = match args.command {
        Commands::Config { command } => return run_config(&cfg, &command),
        other => other,
    };

    let settings = cfg.settings_store().load()?;
    let pool = db::open(&cfg.database_path)
        .await
        .with_context(|| format!("cannot open job store at {}", cfg.database_path.display()))?;
    let manager = JobManager::new(JobsRepo::new(pool), settings);

    match command {
        Commands::Enqueue { job_json, file } => {
            let raw = match (job_json, file) {
                (Some(json), None) => json,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read {}", path.display()))?,
                _ => bail!("provide the job JSON as an argument or with --file"),
            };
            let job = manager.enqueue(JobSubmission::from_json(&raw)?).await?;
            println!("Job enqueued:");
            println!("{}", serde_json::to_string_pretty(&job)?);
        }

        Commands::List { state, limit, json } => {
            let jobs = manager.list_jobs(state, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else if jobs.is_empty() {
                println!("No jobs found");
            } else {
                println!("Found {} job(s):\n", jobs.len());
                for job in &jobs {
                    print_job(job);
                }
            }
        }

        Commands::Status => {
            let stats = manager.stats().await?;
            println!("Jobs:");
            for state in JobState::ALL {
                println!("  {:12} {:>6}", state.as_str(), stats.get(state));
            }
            println!("  {:12} {:>6}", "total", stats.total());

            let pool = worker_pool(&cfg, manager.clone())?;
            let workers = pool.status()?;
            println!("\nWorkers:");
            if workers.is_empty() {
                println!("  none registered");
            }
            for w in &workers {
                println!(
                    "  {} (pid {}) {} since {}",
                    w.record.worker_id,
                    w.record.pid,
                    w.liveness,
                    w.record.started_at.to_rfc3339()
                );
            }

            println!("\nSettings:");
            for (key, value) in manager.settings().entries() {
                println!("  {key} = {value}");
            }
        }

        Commands::Worker { command } => {
            let pool = worker_pool(&cfg, manager)?;
            match command {
                WorkerCommands::Start { count } => {
                    let started = pool.start(count)?;
                    for w in &started {
                        println!("Started {} (pid {})", w.worker_id, w.pid);
                    }
                    println!(
                        "\nStarted {} worker(s); logs in {}. Use 'queuectl worker stop' to stop them.",
                        started.len(),
                        cfg.log_dir.display()
                    );
                }
                WorkerCommands::Stop => {
                    let report = pool.stop().await?;
                    if report.total() == 0 {
                        println!("No registered workers");
                    } else {
                        println!(
                            "Stopped {} worker(s): {} gracefully, {} killed, {} already exited, {} stale",
                            report.total(),
                            report.stopped.len(),
                            report.killed.len(),
                            report.already_exited.len(),
                            report.stale.len()
                        );
                    }
                    for id in &report.orphaned_jobs {
                        println!("Job '{id}' was interrupted; the attempt was counted as failed");
                    }
                }
            }
        }

        Commands::Dlq { command } => {
            let dlq = DeadLetterQueue::new(manager);
            match command {
                DlqCommands::List => {
                    let dead = dlq.list().await?;
                    if dead.is_empty() {
                        println!("Dead letter queue is empty");
                    } else {
                        println!("Found {} job(s) in the dead letter queue:\n", dead.len());
                        for job in &dead {
                            print_job(job);
                        }
                    }
                }
                DlqCommands::Retry { job_id } => {
                    let job = dlq.retry(&job_id).await?;
                    println!("Job '{}' moved back to pending", job.id);
                }
            }
        }

        Commands::Config { .. } => {}
    }

    Ok(())
}

fn run_config(cfg: &Config, command: &ConfigCommands) -> anyhow::Result<()> {
    let store = cfg.settings_store();
    match command {
        ConfigCommands::Get { key: Some(key) } => {
            println!("{key} = {}", store.get(key)?);
        }
        ConfigCommands::Get { key: None } => {
            for (key, value) in store.load()?.entries() {
                println!("{key} = {value}");
            }
        }
        ConfigCommands::Set { key, value } => {
            store.set(key, value)?;
            println!("Set {key} = {}", value.trim());
        }
    }
    Ok(())
}

fn worker_pool(cfg: &Config, manager: JobManager) -> anyhow::Result<WorkerPool> {
    let launcher = WorkerLauncher::new(cfg.worker_program()?)
        .env("QUEUECTL_HOME", &cfg.home)
        .env("QUEUECTL_DB_PATH", &cfg.database_path)
        .log_dir(&cfg.log_dir);

    Ok(WorkerPool::new(WorkerRegistry::new(&cfg.registry_path), launcher, manager)
        .with_grace(cfg.stop_grace))
}

fn print_job(job: &Job) {
    println!("ID: {}", job.id);
    println!("  Command:  {}", job.command);
    println!("  State:    {}", job.state);
    println!("  Attempts: {}/{}", job.attempts, job.max_retries);
    println!("  Priority: {}", job.priority);
    println!("  Updated:  {}", job.updated_at.to_rfc3339());
    if let Some(at) = job.next_retry_at {
        println!("  Next retry: {}", at.to_rfc3339());
    }
    if let Some(err) = &job.last_error {
        println!("  Last error: {err}");
        if job.state == JobState::Dead {
            println!("  Hint: {}", suggested_action(err));
        }
    }
    println!();
}
