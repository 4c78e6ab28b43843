use crate::jobs::outcome::{AttemptReport, FailureReason, Outcome};
use crate::supervisor::process;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Combined output bytes kept while a command runs; older bytes are dropped.
const OUTPUT_BUFFER_BYTES: usize = 256 * 1024;

/// How long to wait for the output pipes to close once the command is gone.
/// Bounded because a background child of the command may hold them open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// stdout and stderr of one command, interleaved in the order chunks arrive.
type SharedOutput = Arc<Mutex<Vec<u8>>>;

/// Runs job commands through a shell under a wall-clock deadline.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: String,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl CommandExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Run `command` and wait at most `timeout` for it.
    /// Never returns an error: every way of failing is an [`Outcome`].
    pub async fn execute(&self, command: &str, timeout: Duration) -> AttemptReport {
        match self.spawn(command) {
            Ok(running) => running.wait(timeout).await,
            Err(report) => report,
        }
    }

    /// Start `command` in its own process group and begin capturing its
    /// output. A launch failure comes back as the finished attempt.
    pub fn spawn(&self, command: &str) -> std::result::Result<RunningCommand, AttemptReport> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(command, error = %e, "failed to launch command");
                return Err(AttemptReport {
                    outcome: Outcome::Failed(FailureReason::LaunchFailed(e.to_string())),
                    output: String::new(),
                    duration_ms: elapsed_ms(start),
                });
            }
        };

        let output = SharedOutput::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_into(stdout, output.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_into(stderr, output.clone())));
        }

        Ok(RunningCommand {
            // process_group(0): the group id is the leader's pid
            pgid: child.id(),
            child,
            output,
            readers,
            start,
        })
    }
}

/// A launched command whose attempt has not been resolved yet.
pub struct RunningCommand {
    child: Child,
    pgid: Option<u32>,
    output: SharedOutput,
    readers: Vec<JoinHandle<()>>,
    start: Instant,
}

impl RunningCommand {
    /// Process group the command and its children run in.
    pub fn pgid(&self) -> Option<u32> {
        self.pgid
    }

    /// Wait at most `timeout` (from now) for the command. On timeout the
    /// whole process group is killed so children spawned by the shell do not
    /// outlive the attempt.
    pub async fn wait(mut self, timeout: Duration) -> AttemptReport {
        let outcome = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => classify(status),
            Ok(Err(e)) => Outcome::Failed(FailureReason::LaunchFailed(format!("wait failed: {e}"))),
            Err(_) => {
                kill_tree(&mut self.child, self.pgid).await;
                Outcome::Failed(FailureReason::Timeout)
            }
        };
        let duration_ms = elapsed_ms(self.start);

        self.drain().await;
        let output = String::from_utf8_lossy(&lock(&self.output)).trim().to_string();

        AttemptReport {
            outcome,
            output,
            duration_ms,
        }
    }

    /// Let the readers reach EOF, up to `DRAIN_GRACE`. Whatever they read
    /// before being cut off stays in the buffer.
    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        for reader in &mut self.readers {
            if tokio::time::timeout_at(deadline, &mut *reader).await.is_err() {
                reader.abort();
            }
        }
    }
}

fn classify(status: ExitStatus) -> Outcome {
    if status.success() {
        return Outcome::Succeeded;
    }
    if let Some(code) = status.code() {
        return Outcome::Failed(FailureReason::ExitStatus(code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return Outcome::Failed(FailureReason::Signal(sig));
        }
    }
    Outcome::Failed(FailureReason::ExitStatus(-1))
}

async fn kill_tree(child: &mut Child, pgid: Option<u32>) {
    if let Some(pgid) = pgid {
        if let Err(e) = process::kill_group(pgid) {
            tracing::debug!(pgid, error = %e, "killpg failed");
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn read_into<R: AsyncRead + Unpin>(mut stream: R, output: SharedOutput) {
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut buf = lock(&output);
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > OUTPUT_BUFFER_BYTES {
                    let excess = buf.len() - OUTPUT_BUFFER_BYTES;
                    buf.drain(..excess);
                }
            }
        }
    }
}

fn lock(output: &SharedOutput) -> MutexGuard<'_, Vec<u8>> {
    output.lock().unwrap_or_else(PoisonError::into_inner)
}

fn elapsed_ms(start: Instant) -> i64 {
    i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_captures_stdout_and_stderr() {
        let report = CommandExecutor::default()
            .execute("echo out; echo err 1>&2", Duration::from_secs(5))
            .await;

        assert_eq!(report.outcome, Outcome::Succeeded);
        assert!(report.output.contains("out"));
        assert!(report.output.contains("err"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_with_its_code() {
        let report = CommandExecutor::default()
            .execute("exit 3", Duration::from_secs(5))
            .await;

        assert_eq!(report.outcome, Outcome::Failed(FailureReason::ExitStatus(3)));
        assert_eq!(report.error().as_deref(), Some("exit status 3"));
    }

    #[tokio::test]
    async fn deadline_kills_the_command() {
        let report = CommandExecutor::default()
            .execute("sleep 30", Duration::from_millis(300))
            .await;

        assert_eq!(report.outcome, Outcome::Failed(FailureReason::Timeout));
        assert!(report.duration_ms >= 300);
        assert!(report.duration_ms < 5_000, "took {}ms", report.duration_ms);
    }

    #[tokio::test]
    async fn output_read_before_the_drain_cutoff_is_kept() {
        // the background sleep inherits the pipes and holds them open
        let began = Instant::now();
        let report = CommandExecutor::default()
            .execute("echo hello; sleep 6 &", Duration::from_secs(10))
            .await;

        assert_eq!(report.outcome, Outcome::Succeeded);
        assert_eq!(report.output, "hello");
        assert!(began.elapsed() < Duration::from_secs(5), "{:?}", began.elapsed());
    }

    #[tokio::test]
    async fn streams_are_combined_in_arrival_order() {
        let report = CommandExecutor::default()
            .execute(
                "echo a; sleep 0.2; echo b 1>&2; sleep 0.2; echo c",
                Duration::from_secs(5),
            )
            .await;

        assert_eq!(report.outcome, Outcome::Succeeded);
        assert_eq!(report.output, "a\nb\nc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_command_leads_its_own_process_group() {
        let Ok(running) = CommandExecutor::default().spawn("sleep 0.2") else {
            panic!("sleep failed to launch");
        };
        let pgid = running.pgid().unwrap();
        assert_eq!(unsafe { libc::getpgid(pgid as libc::pid_t) }, pgid as libc::pid_t);
        assert_ne!(pgid, std::process::id());

        let report = running.wait(Duration::from_secs(5)).await;
        assert_eq!(report.outcome, Outcome::Succeeded);
    }

    #[tokio::test]
    async fn missing_shell_is_a_launch_failure() {
        let report = CommandExecutor::new("/definitely/not/a/shell")
            .execute("true", Duration::from_secs(1))
            .await;

        assert!(matches!(
            report.outcome,
            Outcome::Failed(FailureReason::LaunchFailed(_))
        ));
    }
}
