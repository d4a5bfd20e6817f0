//! Process execution.
//!
//! [`ProcessRunner`] is the seam between scheduling and the operating
//! system. The OS implementation spawns the command, feeds stdin, drains
//! stdout and stderr under a capture cap, and enforces the per-attempt
//! timeout and batch cancellation by killing the child. The child is
//! spawned with `kill_on_drop`, so a dropped attempt future cannot leak a
//! process.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::error::ProcessError;
use crate::result::Captured;
use crate::spec::{EnvInherit, EnvSpec, ResolvedCommand, StdinSpec};

/// Read buffer size for draining child pipes.
const READ_CHUNK: usize = 8 * 1024;

/// How an attempt came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEnd {
    /// The process exited on its own (cleanly or via a signal).
    Completed,
    /// The attempt hit its timeout and the process was killed.
    TimedOut,
    /// The batch was cancelled and the process was killed.
    Cancelled,
}

/// Outcome of one process attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    /// Exit code; `None` when the process was killed or died to a signal.
    pub exit_code: Option<i32>,
    pub stdout: Captured,
    pub stderr: Captured,
    /// Wall-clock time from spawn to reap. Cut short at the timeout when
    /// [`ProcessOutcome::ended`] is `TimedOut`.
    pub duration: Duration,
    pub ended: ProcessEnd,
}

impl ProcessOutcome {
    pub fn timed_out(&self) -> bool {
        self.ended == ProcessEnd::TimedOut
    }
}

/// Executes one resolved command. Implemented by [`OsProcessRunner`] for
/// real processes; tests substitute stubs.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        cmd: &ResolvedCommand,
        cancel: &CancelSignal,
    ) -> Result<ProcessOutcome, ProcessError>;
}

/// Runner backed by real OS processes.
#[derive(Debug, Clone)]
pub struct OsProcessRunner {
    /// Per-stream capture cap; bytes beyond it are drained but dropped.
    max_capture_bytes: usize,
}

impl OsProcessRunner {
    pub fn new(max_capture_bytes: usize) -> Self {
        Self { max_capture_bytes }
    }
}

impl Default for OsProcessRunner {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

#[async_trait]
impl ProcessRunner for OsProcessRunner {
    async fn run(
        &self,
        cmd: &ResolvedCommand,
        cancel: &CancelSignal,
    ) -> Result<ProcessOutcome, ProcessError> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_env(&mut command, &cmd.env);
        if let Some(dir) = &cmd.working_dir {
            command.current_dir(dir);
        }

        let stdin_bytes = match &cmd.stdin {
            None => {
                command.stdin(Stdio::null());
                None
            }
            Some(StdinSpec::Inline(text)) => {
                command.stdin(Stdio::piped());
                Some(text.clone().into_bytes())
            }
            Some(StdinSpec::File(path)) => {
                let file = std::fs::File::open(path).map_err(|e| ProcessError::StdinFile {
                    path: path.clone(),
                    source: e,
                })?;
                command.stdin(Stdio::from(file));
                None
            }
        };

        let start = Instant::now();
        let mut child = command.spawn().map_err(|e| ProcessError::Spawn {
            program: cmd.program.clone(),
            source: e,
        })?;

        // Feed inline stdin from its own task; a full pipe must never wedge
        // the wait below. Dropping the handle closes the child's stdin.
        if let Some(bytes) = stdin_bytes {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    if let Err(error) = stdin.write_all(&bytes).await {
                        debug!(%error, "stdin feed ended early");
                    }
                });
            }
        }

        // Drain both pipes concurrently with the wait; a chatty child must
        // never block on a full pipe while we wait for it.
        let cap = self.max_capture_bytes;
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_capped(out, cap)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_capped(err, cap)));

        let deadline = tokio::time::sleep(cmd.timeout);
        tokio::pin!(deadline);

        let (status, ended) = tokio::select! {
            status = child.wait() => (Some(status?), ProcessEnd::Completed),
            _ = &mut deadline => {
                warn!(program = %cmd.program, timeout = ?cmd.timeout, "attempt timed out, killing process");
                child.kill().await?;
                (None, ProcessEnd::TimedOut)
            }
            _ = cancel.cancelled() => {
                debug!(program = %cmd.program, "cancellation observed, killing process");
                child.kill().await?;
                (None, ProcessEnd::Cancelled)
            }
        };

        let stdout = join_capture(stdout_task).await;
        let stderr = join_capture(stderr_task).await;

        Ok(ProcessOutcome {
            exit_code: status.and_then(|s| s.code()),
            stdout,
            stderr,
            duration: start.elapsed(),
            ended,
        })
    }
}

fn apply_env(command: &mut Command, env: &EnvSpec) {
    match &env.inherit {
        EnvInherit::All => {}
        EnvInherit::None => {
            command.env_clear();
        }
        EnvInherit::Allow(keys) => {
            command.env_clear();
            for key in keys {
                if let Ok(value) = std::env::var(key) {
                    command.env(key, value);
                }
            }
        }
        EnvInherit::Deny(keys) => {
            for key in keys {
                command.env_remove(key);
            }
        }
    }
    for (key, value) in &env.set {
        command.env(key, value);
    }
    for key in &env.unset {
        command.env_remove(key);
    }
}

/// Drain a stream to EOF, keeping at most `cap` bytes.
async fn read_capped<R>(mut reader: R, cap: usize) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut kept: Vec<u8> = Vec::with_capacity(cap.min(READ_CHUNK));
    let mut scratch = [0u8; READ_CHUNK];
    let mut total: u64 = 0;

    loop {
        match reader.read(&mut scratch).await {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                if kept.len() < cap {
                    let take = n.min(cap - kept.len());
                    kept.extend_from_slice(&scratch[..take]);
                }
            }
            // Keep what we have; the pipe is gone either way.
            Err(_) => break,
        }
    }

    let truncated = total > kept.len() as u64;
    Captured {
        text: String::from_utf8_lossy(&kept).to_string(),
        truncated,
        total_bytes: total,
    }
}

async fn join_capture(task: Option<tokio::task::JoinHandle<Captured>>) -> Captured {
    match task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Captured::default(),
    }
}
