//! Bounded external program execution.
//!
//! Every subprocess the file manager drives goes through [`run`]: optional
//! scripted stdin, captured output, and a wait bound after which the child
//! is killed and the call fails with whatever it wrote to stderr.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rascsi_core::{Error, Result};

/// How long to wait for output pipes after killing a timed out child.
const KILL_DRAIN: Duration = Duration::from_secs(1);

/// Captured result of a finished program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `-1` when terminated by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stdout on success, stderr otherwise.
    pub fn text(&self) -> &str {
        if self.success() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Spawn `program` with `args`, feed `stdin`, and wait at most `timeout`.
///
/// A program that cannot be spawned is reported as a [`Error::CommandFailure`]
/// carrying the OS error. A non-zero exit is NOT an error here; see
/// [`run_checked`].
pub async fn run(
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput> {
    debug!(program, ?args, "Running external program");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::CommandFailure {
            program: program.to_string(),
            stderr: e.to_string(),
        })?;

    let stdout_task = child.stdout.take().map(|mut out| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf).await;
            buf
        })
    });
    let stderr_task = child.stderr.take().map(|mut err| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf).await;
            buf
        })
    });

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // A child that exits early closes its end; the exit status tells the rest.
        if let Err(e) = pipe.write_all(input).await {
            debug!(program, error = %e, "stdin closed early");
        }
        drop(pipe);
    }

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Some(status?),
        Err(_) => {
            warn!(program, timeout_secs = timeout.as_secs(), "Program timed out, killing");
            if let Err(e) = child.kill().await {
                warn!(program, error = %e, "Failed to kill timed out program");
            }
            None
        }
    };

    // Grandchildren may still hold the pipes after a kill.
    let drain = if status.is_some() { None } else { Some(KILL_DRAIN) };
    let stdout = collect(stdout_task, drain).await;
    let stderr = collect(stderr_task, drain).await;

    match status {
        Some(status) => {
            let output = CommandOutput {
                code: status.code().unwrap_or(-1),
                stdout,
                stderr,
            };
            debug!(program, code = output.code, "Program finished");
            Ok(output)
        }
        None => Err(Error::Timeout {
            operation: program.to_string(),
            stderr,
        }),
    }
}

/// Like [`run`], but a non-zero exit becomes [`Error::CommandFailure`].
pub async fn run_checked(
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput> {
    let output = run(program, args, stdin, timeout).await?;
    if !output.success() {
        warn!(program, code = output.code, stderr = %output.stderr.trim(), "Program failed");
        return Err(Error::CommandFailure {
            program: program.to_string(),
            stderr: output.stderr,
        });
    }
    Ok(output)
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>, bound: Option<Duration>) -> String {
    let Some(handle) = task else {
        return String::new();
    };
    let bytes = match bound {
        Some(bound) => match tokio::time::timeout(bound, handle).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => Vec::new(),
        },
        None => handle.await.unwrap_or_default(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Build an owned argument vector.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
