//! External command execution with normalized result signaling
//!
//! Every external tool the harness touches goes through [`RunInvoker`]:
//! it captures stdout/stderr, maps the exit status onto the harness error
//! type, tolerates the one benign warning the container backend emits on
//! fully-unified hierarchies, and retries once on the backend's transient
//! "bad handshake" flake.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{HarnessError, HarnessResult};

/// LXD throws this warning on systems that are fully running cgroup v2.
/// Ignore it, but fail if any other warnings/errors are raised.
const BENIGN_LXD_WARNING: &str = "WARNING: cgroup v2 is not fully supported yet";

/// Transient websocket flake from the container backend; worth one retry.
const BAD_HANDSHAKE: &str = "bad handshake";

const DEFAULT_HANDSHAKE_BACKOFF: Duration = Duration::from_secs(5);

/// How a command line is to be interpreted.
///
/// An explicit tagged variant instead of inspecting the argument's shape
/// at runtime: either a pre-split argument vector, or a single string for
/// the shell to interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Argv(Vec<String>),
    Shell(String),
}

impl Invocation {
    pub fn argv<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::Argv(parts.into_iter().map(Into::into).collect())
    }

    pub fn shell(line: impl Into<String>) -> Self {
        Invocation::Shell(line.into())
    }

    /// Single-line rendering for logs and error messages.
    pub fn rendered(&self) -> String {
        match self {
            Invocation::Argv(parts) => parts.join(" "),
            Invocation::Shell(line) => line.clone(),
        }
    }

    fn command(&self) -> HarnessResult<Command> {
        match self {
            Invocation::Argv(parts) => {
                let (program, args) = parts.split_first().ok_or_else(|| HarnessError::Run {
                    command: String::new(),
                    code: None,
                    stdout: String::new(),
                    stderr: "empty argument vector".to_string(),
                })?;
                let mut cmd = Command::new(program);
                cmd.args(args);
                Ok(cmd)
            }
            Invocation::Shell(line) => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(line);
                Ok(cmd)
            }
        }
    }
}

struct Captured {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

/// Executes external commands synchronously (from the caller's point of
/// view) and normalizes their result/error signaling.
#[derive(Debug, Clone)]
pub struct RunInvoker {
    handshake_backoff: Duration,
}

impl Default for RunInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunInvoker {
    pub fn new() -> Self {
        Self {
            handshake_backoff: DEFAULT_HANDSHAKE_BACKOFF,
        }
    }

    /// Configure the backoff before the single bad-handshake retry
    /// (shortened in tests).
    pub fn with_handshake_backoff(mut self, backoff: Duration) -> Self {
        self.handshake_backoff = backoff;
        self
    }

    /// Run the command to completion and return its trimmed stdout.
    ///
    /// Success means exit code 0 and an empty (or benign-only) error
    /// stream; anything else surfaces as [`HarnessError::Run`] carrying
    /// the command, exit code, stdout and stderr verbatim. A transient
    /// "bad handshake" from the container backend is retried exactly once
    /// after a fixed backoff.
    pub async fn run(&self, invocation: &Invocation) -> HarnessResult<String> {
        let captured = self.capture(invocation).await?;

        if captured.stderr.contains(BAD_HANDSHAKE) {
            warn!(
                "bad handshake from backend, retrying '{}' in {:?}",
                invocation.rendered(),
                self.handshake_backoff
            );
            tokio::time::sleep(self.handshake_backoff).await;
            let retried = self.capture(invocation).await?;
            return Self::evaluate(invocation, retried);
        }

        Self::evaluate(invocation, captured)
    }

    /// Bounded-wait variant for commands that spawn long-lived children.
    ///
    /// If the command does not return within `limit`, a non-empty error
    /// stream captured so far is a failure, while an empty one is a soft
    /// success: the invoked command is assumed to have detached a worker
    /// and legitimately never returns. The child is deliberately not
    /// killed on timeout.
    pub async fn run_with_timeout(
        &self,
        invocation: &Invocation,
        limit: Duration,
    ) -> HarnessResult<String> {
        let mut cmd = invocation.command()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(drain_pipe(stdout_pipe, Arc::clone(&stdout_buf)));
        let stderr_task = tokio::spawn(drain_pipe(stderr_pipe, Arc::clone(&stderr_buf)));

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                // Let the drain tasks observe EOF before snapshotting.
                let _ = tokio::time::timeout(Duration::from_millis(250), stdout_task).await;
                let _ = tokio::time::timeout(Duration::from_millis(250), stderr_task).await;

                let captured = Captured {
                    code: status.code(),
                    stdout: snapshot(&stdout_buf).await,
                    stderr: snapshot(&stderr_buf).await,
                };
                Self::log(invocation, &captured);
                Self::evaluate(invocation, captured)
            }
            _ = tokio::time::sleep(limit) => {
                stdout_task.abort();
                stderr_task.abort();
                let stderr = snapshot(&stderr_buf).await;

                if stderr.is_empty() {
                    debug!(
                        "'{}' still running after {:?}; treating as a detached worker",
                        invocation.rendered(),
                        limit
                    );
                    Ok(String::new())
                } else {
                    Err(HarnessError::Run {
                        command: invocation.rendered(),
                        code: None,
                        stdout: snapshot(&stdout_buf).await,
                        stderr,
                    })
                }
            }
        }
    }

    async fn capture(&self, invocation: &Invocation) -> HarnessResult<Captured> {
        let mut cmd = invocation.command()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd.output().await?;

        let captured = Captured {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };
        Self::log(invocation, &captured);
        Ok(captured)
    }

    fn log(invocation: &Invocation, captured: &Captured) {
        debug!(
            "run:\n\tcommand = {}\n\tret = {:?}\n\tstdout = {}\n\tstderr = {}",
            invocation.rendered(),
            captured.code,
            captured.stdout,
            captured.stderr
        );
    }

    fn evaluate(invocation: &Invocation, captured: Captured) -> HarnessResult<String> {
        let stderr_ok = captured.stderr.is_empty() || captured.stderr.contains(BENIGN_LXD_WARNING);

        if captured.code == Some(0) && stderr_ok {
            return Ok(captured.stdout);
        }

        Err(HarnessError::Run {
            command: invocation.rendered(),
            code: captured.code,
            stdout: captured.stdout,
            stderr: captured.stderr,
        })
    }
}

async fn drain_pipe<R>(pipe: Option<R>, buf: Arc<Mutex<Vec<u8>>>)
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let Some(mut pipe) = pipe else { return };
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.lock().await.extend_from_slice(&chunk[..n]),
        }
    }
}

async fn snapshot(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8_lossy(&buf.lock().await).trim().to_string()
}
