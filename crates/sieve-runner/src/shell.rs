//! Shell-based step execution on the host.

use crate::output::{OutputStream, OutputTail};
use async_trait::async_trait;
use sieve_core::ports::{StepContext, StepExecutor, StepOutcome};
use sieve_core::{Error, Result};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to keep reading output after the process is gone. Grandchildren
/// that escaped the process group can hold the pipes open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for step execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Used when the step context carries no timeout.
    pub default_timeout: Option<Duration>,
    /// Time between SIGTERM and SIGKILL when a step is stopped.
    pub kill_grace: Duration,
    /// Output lines kept per step.
    pub tail_lines: usize,
    /// Start steps with the runner's own environment.
    pub inherit_env: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            kill_grace: Duration::from_secs(10),
            tail_lines: 200,
            inherit_env: true,
        }
    }
}

impl RunnerConfig {
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines;
        self
    }
}

enum Exit {
    Finished(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs `<shell> -c <script>` on the host.
pub struct ShellRunner {
    config: RunnerConfig,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn command(&self, ctx: &StepContext) -> Command {
        let workdir = match &ctx.step.working_directory {
            Some(dir) => ctx.workspace.join(dir),
            None => ctx.workspace.clone(),
        };

        let mut cmd = Command::new(&ctx.step.shell);
        cmd.arg("-c").arg(&ctx.step.run).current_dir(workdir);
        if !self.config.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so signals reach everything the script started.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// SIGTERM, then SIGKILL once the grace period is over.
    async fn terminate(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            return;
        };
        signal_group(pid, "TERM").await;

        if tokio::time::timeout(self.config.kill_grace, child.wait())
            .await
            .is_ok()
        {
            debug!(pid, "Step exited after SIGTERM");
            return;
        }

        warn!(
            pid,
            grace_ms = self.config.kill_grace.as_millis() as u64,
            "Step ignored SIGTERM, killing"
        );
        signal_group(pid, "KILL").await;
        if let Err(e) = child.kill().await {
            warn!(pid, error = %e, "Failed to kill step");
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[async_trait]
impl StepExecutor for ShellRunner {
    async fn run(&self, ctx: StepContext, cancel: CancellationToken) -> Result<StepOutcome> {
        let start = Instant::now();
        let timeout = ctx.timeout.or(self.config.default_timeout);

        info!(
            run_id = %ctx.run_id,
            job = %ctx.job,
            step = %ctx.step.name,
            shell = %ctx.step.shell,
            workspace = %ctx.workspace.display(),
            "Executing step"
        );

        let mut child = self
            .command(&ctx)
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn `{}`: {e}", ctx.step.shell)))?;

        let tail = Arc::new(Mutex::new(OutputTail::new(self.config.tail_lines)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(capture(stdout, OutputStream::Stdout, Arc::clone(&tail), &ctx));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(capture(stderr, OutputStream::Stderr, Arc::clone(&tail), &ctx));
        }

        let exit = tokio::select! {
            status = child.wait() => Exit::Finished(status),
            _ = expire(timeout) => Exit::TimedOut,
            _ = cancel.cancelled() => Exit::Cancelled,
        };
        if !matches!(exit, Exit::Finished(_)) {
            self.terminate(&mut child).await;
        }

        for reader in readers {
            drain(reader).await;
        }
        let output = tail.lock().await.render();
        let duration_ms = start.elapsed().as_millis() as u64;

        let outcome = match exit {
            Exit::Finished(status) => {
                let status = status
                    .map_err(|e| Error::Internal(format!("Failed to wait for step: {e}")))?;
                StepOutcome {
                    exit_code: exit_code(status),
                    output,
                    duration_ms,
                    ..Default::default()
                }
            }
            Exit::TimedOut => {
                warn!(
                    job = %ctx.job,
                    step = %ctx.step.name,
                    timeout_ms = timeout.map(|t| t.as_millis() as u64),
                    "Step timed out"
                );
                StepOutcome {
                    exit_code: -1,
                    output,
                    duration_ms,
                    timed_out: true,
                    ..Default::default()
                }
            }
            Exit::Cancelled => {
                info!(job = %ctx.job, step = %ctx.step.name, "Step cancelled");
                StepOutcome {
                    exit_code: -1,
                    output,
                    duration_ms,
                    cancelled: true,
                    ..Default::default()
                }
            }
        };

        debug!(
            job = %ctx.job,
            step = %ctx.step.name,
            exit_code = outcome.exit_code,
            duration_ms,
            "Step finished"
        );
        Ok(outcome)
    }
}

fn capture<R>(
    reader: R,
    stream: OutputStream,
    tail: Arc<Mutex<OutputTail>>,
    ctx: &StepContext,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let job = ctx.job.clone();
    let step = ctx.step.name.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(job = %job, step = %step, stream = ?stream, line = %line, "Step output");
            tail.lock().await.push(stream, line);
        }
    })
}

async fn drain(reader: JoinHandle<()>) {
    let abort = reader.abort_handle();
    if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
        abort.abort();
    }
}

async fn expire(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Signal a whole process group via `kill`.
async fn signal_group(pid: u32, signal: &str) {
    let result = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        warn!(pid, signal, error = %e, "Failed to signal step");
    }
}

/// Exit code, or 128 + signal number for signalled processes.
fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_core::ids::RunId;
    use sieve_core::pipeline::StepDefinition;
    use std::collections::HashMap;
    use std::path::Path;
    use tokio_test::{assert_err, assert_ok};

    fn ctx(workspace: &Path, script: &str) -> StepContext {
        StepContext {
            run_id: RunId::new(),
            job: "build".to_string(),
            step: StepDefinition {
                name: "script".to_string(),
                run: script.to_string(),
                shell: "sh".to_string(),
                working_directory: None,
                env: HashMap::new(),
                timeout_minutes: None,
            },
            workspace: workspace.to_path_buf(),
            env: HashMap::new(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_shell_runner_success() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::default();

        let outcome = assert_ok!(
            runner
                .run(ctx(dir.path(), "echo hello; echo oops >&2"), CancellationToken::new())
                .await
        );
        assert!(outcome.success());
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.output.contains("hello"));
        assert!(outcome.output.contains("[stderr] oops"));
    }

    #[tokio::test]
    async fn test_shell_runner_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::default();

        let outcome = runner
            .run(ctx(dir.path(), "echo failing; exit 3"), CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.output, "failing");
    }

    #[tokio::test]
    async fn test_env_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let runner = ShellRunner::default();

        let mut ctx = ctx(dir.path(), "echo \"$GREETING\"; basename \"$(pwd)\"");
        ctx.env.insert("GREETING".to_string(), "hi".to_string());
        ctx.step.working_directory = Some("sub".to_string());

        let outcome = runner.run(ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.output, "hi\nsub");
    }

    #[tokio::test]
    async fn test_output_tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(RunnerConfig::default().with_tail_lines(3));

        let script = "i=1; while [ $i -le 10 ]; do echo $i; i=$((i+1)); done";
        let outcome = runner
            .run(ctx(dir.path(), script), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.output, "... 7 earlier lines omitted\n8\n9\n10");
    }

    #[tokio::test]
    async fn test_timeout_stops_step() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(RunnerConfig::default().with_kill_grace(Duration::from_secs(1)));

        let mut ctx = ctx(dir.path(), "sleep 30");
        ctx.timeout = Some(Duration::from_millis(200));

        let started = Instant::now();
        let outcome = runner.run(ctx, CancellationToken::new()).await.unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.cancelled);
        assert!(!outcome.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancel_escalates_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(
            RunnerConfig::default().with_kill_grace(Duration::from_millis(300)),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = runner
            .run(ctx(dir.path(), "trap '' TERM; sleep 30"), cancel)
            .await
            .unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.exit_code, -1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_shell_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::default();
        let mut ctx = ctx(dir.path(), "true");
        ctx.step.shell = "definitely-not-a-shell".to_string();

        let err = assert_err!(runner.run(ctx, CancellationToken::new()).await);
        assert!(err.to_string().contains("definitely-not-a-shell"));
    }
}
