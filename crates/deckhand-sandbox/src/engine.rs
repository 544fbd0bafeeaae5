//! Execution engine.

use std::io::Read;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use deckhand_types::{EXIT_CANCELLED, EXIT_TIMEOUT};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{ChildEnv, JobLog, ProcessTree, SandboxError, SandboxResult};

const READ_CHUNK: usize = 8 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Time between SIGTERM and SIGKILL.
    pub grace: Duration,
    /// How long to keep reading output after the installer has exited.
    ///
    /// Background processes that inherited the output pipe can keep it open
    /// indefinitely; past this point the rest of the process group is killed
    /// and their output is discarded.
    pub drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

/// What to run for one attempt.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: ChildEnv,
    pub timeout: Duration,
}

impl ExecSpec {
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>, env: ChildEnv) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcome
// ─────────────────────────────────────────────────────────────────────────────

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with a status code.
    Exited(i32),
    /// Terminated by a signal the agent did not send.
    Signaled(i32),
    /// Killed at the deadline.
    TimedOut,
    /// Stopped because the agent is shutting down.
    Cancelled,
}

impl ExitKind {
    /// Shell-style exit code.
    pub fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => 128 + signal,
            Self::TimedOut => EXIT_TIMEOUT,
            Self::Cancelled => EXIT_CANCELLED,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Exited(0)
    }

    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }
        Self::Exited(-1)
    }
}

/// Result of one engine run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit: ExitKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Output was still arriving when the drain timeout expired.
    pub output_truncated: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Cancelled,
}

/// Runs one program at a time in its own process group.
#[derive(Debug, Clone, Default)]
pub struct ExecutionEngine {
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `spec` to completion, timeout, or cancellation.
    ///
    /// stdout and stderr go through one pipe into `log`, so their relative
    /// order is preserved. Only engine faults are errors; any way the program
    /// ends is an [`ExitKind`].
    ///
    /// Descendants still holding the output pipe once `drain_timeout` has
    /// passed after exit are killed with the group. Daemons that redirected
    /// their output or started their own session are left running.
    pub async fn run(
        &self,
        spec: &ExecSpec,
        log: &JobLog,
        cancel: &CancellationToken,
    ) -> SandboxResult<RunOutcome> {
        let (reader, writer) = std::io::pipe()?;
        let writer_err = writer.try_clone()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(spec.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_err))
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(
            program = %spec.program.display(),
            args = ?spec.args,
            cwd = %spec.working_dir.display(),
            timeout_secs = spec.timeout.as_secs(),
            "Spawning installer"
        );

        let started_at = Utc::now();
        let started = Instant::now();
        let spawned = cmd.spawn();
        // The command holds the parent's copies of the write end; EOF only
        // arrives once they are closed.
        drop(cmd);
        let mut child = spawned.map_err(|source| SandboxError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let tree = ProcessTree::new(child.id());
        let detached = Arc::new(AtomicBool::new(false));
        let drained = spawn_reader(reader, log.clone(), detached.clone());

        let deadline = tokio::time::sleep(spec.timeout);
        tokio::pin!(deadline);

        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            _ = &mut deadline => Wake::Deadline,
            _ = cancel.cancelled() => Wake::Cancelled,
        };

        let exit = match wake {
            Wake::Exited(status) => ExitKind::from_status(status.map_err(SandboxError::Wait)?),
            Wake::Deadline => {
                tracing::warn!(
                    pgid = ?tree.pgid(),
                    timeout_secs = spec.timeout.as_secs(),
                    "Installer exceeded its timeout, terminating process group"
                );
                tree.terminate(&mut child, self.config.grace).await;
                ExitKind::TimedOut
            }
            Wake::Cancelled => {
                tracing::info!(pgid = ?tree.pgid(), "Shutdown requested, terminating installer");
                tree.terminate(&mut child, self.config.grace).await;
                ExitKind::Cancelled
            }
        };

        let output_truncated = match tokio::time::timeout(self.config.drain_timeout, drained).await
        {
            Ok(_) => false,
            Err(_) => {
                detached.store(true, Ordering::Release);
                tracing::warn!(
                    pgid = ?tree.pgid(),
                    log = %log.path().display(),
                    "Output pipe still held open after exit, killing the rest of the process group"
                );
                // Closes the pipe, which ends the reader thread and its log handle.
                tree.kill_remaining();
                true
            }
        };

        let completed_at = Utc::now();
        tracing::debug!(exit = ?exit, elapsed_ms = started.elapsed().as_millis() as u64, "Installer finished");

        Ok(RunOutcome {
            exit,
            started_at,
            completed_at,
            elapsed: started.elapsed(),
            output_truncated,
        })
    }
}

/// Copy the pipe into the log on a plain thread.
///
/// A plain thread is used so a pipe held open by a stray background process
/// never blocks runtime shutdown.
fn spawn_reader(
    mut reader: std::io::PipeReader,
    log: JobLog,
    detached: Arc<AtomicBool>,
) -> oneshot::Receiver<()> {
    let (done_tx, done_rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name("installer-output".to_string())
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if !detached.load(Ordering::Acquire) {
                            log.append(&buf[..n]);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read installer output");
                        break;
                    }
                }
            }
            let _ = done_tx.send(());
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "Failed to start output reader thread");
    }
    done_rx
}
