//! Child process supervision shared by every backend
//!
//! Spawns the command in its own process group with piped output, echoes
//! lines as they arrive and enforces the timeout and cancellation contract:
//! on either, the whole process group is killed, the output readers are
//! abandoned and a distinguished error is returned.

use crate::error::{ExecutionError, NodeResult};
use crate::ui;
use std::future;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long to wait for output pipes after the child exited
const READER_GRACE: Duration = Duration::from_secs(2);

/// Captured output of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Line echo settings
#[derive(Debug, Clone)]
pub struct Echo {
    pub label: String,
    pub enabled: bool,
    /// Stop echoing at the first line starting with this marker
    pub stop_at: Option<String>,
}

impl Echo {
    pub fn new(label: impl Into<String>, enabled: bool) -> Self {
        Echo {
            label: label.into(),
            enabled,
            stop_at: None,
        }
    }

    pub fn stop_at(mut self, marker: impl Into<String>) -> Self {
        self.stop_at = Some(marker.into());
        self
    }
}

/// What the child reads on stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// `/dev/null`
    Null,
    /// A pipe that stays open until the child exits or is killed, so the
    /// child sees end of file exactly when its supervisor lets go of it
    Held,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Run `command` to completion, honouring `timeout` and `cancel`
pub async fn supervise(
    mut command: Command,
    input: Input,
    echo: &Echo,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> NodeResult<Captured> {
    command
        .stdin(match input {
            Input::Null => Stdio::null(),
            Input::Held => Stdio::piped(),
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let started = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| ExecutionError::Spawn(e.to_string()))?;
    let pid = child.id();
    debug!(label = %echo.label, pid, "process spawned");

    let held = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_lines(out, echo.clone(), Stream::Stdout)));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(read_lines(err, echo.clone(), Stream::Stderr)));

    let waited = tokio::select! {
        status = child.wait() => Ok(status),
        limit = deadline(timeout) => Err(ExecutionError::Timeout(limit)),
        _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
    };
    drop(held);

    let status = match waited {
        Ok(status) => status.map_err(|e| ExecutionError::Spawn(e.to_string()))?,
        Err(error) => {
            warn!(label = %echo.label, kind = error.kind(), "terminating process group");
            terminate(&mut child, pid, &echo.label).await;
            for handle in [stdout, stderr].into_iter().flatten() {
                handle.abort();
            }
            return Err(error);
        }
    };

    let stdout = collect(stdout).await;
    let stderr = collect(stderr).await;

    Ok(Captured {
        exit_code: status.code(),
        stdout,
        stderr,
        duration: started.elapsed(),
    })
}

/// Kill the child's process group, then the child itself, and reap it
async fn terminate(child: &mut Child, pid: Option<u32>, label: &str) {
    #[cfg(unix)]
    if let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!(label, pgid = pid, error = %e, "failed to signal process group");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.kill().await {
        warn!(label, error = %e, "failed to kill process");
    }
}

async fn deadline(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(limit) => {
            tokio::time::sleep(limit).await;
            limit
        }
        None => future::pending().await,
    }
}

async fn collect(handle: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(READER_GRACE, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            debug!(error = %e, "output reader failed");
            String::new()
        }
        Err(_) => {
            // A background child still holds the pipe open
            handle.abort();
            String::new()
        }
    }
}

async fn read_lines<R>(reader: R, echo: Echo, stream: Stream) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut captured = String::new();
    let mut echoing = echo.enabled;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(label = %echo.label, error = %e, "stopped reading output");
                break;
            }
        };

        if let Some(marker) = &echo.stop_at {
            if line.starts_with(marker.as_str()) {
                echoing = false;
            }
        }
        if echoing {
            match stream {
                Stream::Stdout => ui::task_stdout(&echo.label, &line),
                Stream::Stderr => ui::task_stderr(&echo.label, &line),
            }
        }

        captured.push_str(&line);
        captured.push('\n');
    }

    captured
}
