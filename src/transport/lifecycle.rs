//! Child process lifecycle for pipe backends.
//!
//! Spawns the backend process with piped stdio, drains stderr into the log
//! (keeping the tail for diagnostics), and watches for exit. The watcher owns
//! the `Child`; dropping the returned [`ProcessHandle`] kills the process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;

use super::errors::TransportError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Number of stderr lines retained for failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// Maximum characters of stderr appended to an error message.
const STDERR_SUFFIX_MAX_CHARS: usize = 2000;

/// Grace period between the kill signal and giving up on `wait()`.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Spawn Parameters ────────────────────────────────────────────────────────

/// What to run for a pipe backend.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
}

// ─── Stderr Tail ─────────────────────────────────────────────────────────────

/// Bounded buffer of the most recent stderr lines.
#[derive(Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    /// Snapshot of the retained lines, joined with newlines.
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Format a stderr suffix for error messages (empty if nothing captured).
    pub fn error_suffix(&self) -> String {
        format_stderr_suffix(&self.snapshot())
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.chars().count() > STDERR_SUFFIX_MAX_CHARS {
        let head: String = trimmed.chars().take(STDERR_SUFFIX_MAX_CHARS).collect();
        format!(" | stderr: {head}...(truncated)")
    } else {
        format!(" | stderr: {trimmed}")
    }
}

// ─── ProcessHandle ───────────────────────────────────────────────────────────

/// A spawned backend process.
pub struct ProcessHandle {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr_tail: StderrTail,
    /// Resolves once the process has exited (for any reason).
    pub exited: oneshot::Receiver<String>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    /// Split off the kill switch so it can live apart from the stdio handles.
    pub fn take_kill_switch(&mut self) -> KillSwitch {
        KillSwitch {
            tx: self.kill_tx.take(),
        }
    }
}

/// Kills the process when triggered or dropped.
pub struct KillSwitch {
    tx: Option<oneshot::Sender<()>>,
}

impl KillSwitch {
    pub fn kill(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for KillSwitch {
    fn drop(&mut self) {
        self.kill();
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a backend process with piped stdio.
pub fn spawn_process(backend: &str, spec: &ProcessSpec) -> Result<ProcessHandle, TransportError> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args);

    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    if let Some(dir) = spec.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| TransportError::Connection {
        backend: backend.to_string(),
        reason: format!("failed to spawn '{}': {e}", spec.command),
    })?;

    let stdin = child.stdin.take().ok_or(TransportError::Connection {
        backend: backend.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(TransportError::Connection {
        backend: backend.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr_tail = StderrTail::default();
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_stderr(backend.to_string(), stderr, stderr_tail.clone()));
    }

    let pid = child.id();
    let (kill_tx, kill_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(watch_process(backend.to_string(), child, kill_rx, exit_tx));

    tracing::info!(
        backend,
        command = %spec.command,
        args = ?spec.args,
        pid = ?pid,
        "spawned pipe backend"
    );

    Ok(ProcessHandle {
        stdin,
        stdout,
        stderr_tail,
        exited: exit_rx,
        kill_tx: Some(kill_tx),
    })
}

/// Log stderr lines and keep the most recent ones.
async fn drain_stderr(backend: String, stderr: ChildStderr, tail: StderrTail) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    tracing::debug!(backend = %backend, line = %trimmed, "backend stderr");
                    tail.push(trimmed);
                }
            }
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "stderr read error");
                break;
            }
        }
    }
}

/// Own the child until it exits or a kill is requested.
async fn watch_process(
    backend: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<String>,
) {
    let reason = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => format!("process exited with {status}"),
            Err(e) => format!("failed to wait on process: {e}"),
        },
        // Fires on an explicit kill and when the switch is dropped.
        _ = kill_rx => {
            let _ = child.start_kill();
            match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => format!("process killed ({status})"),
                _ => "process kill requested".to_string(),
            }
        }
    };

    tracing::info!(backend = %backend, reason = %reason, "pipe backend process ended");
    let _ = exit_tx.send(reason);
}

// ─── Tests ───────────────────────────────────────────────────────────────────
