//! Pipe transport: line-delimited JSON over a child process's stdio.
//!
//! One process serves any number of concurrent calls. Every request carries
//! a fresh correlation id and a background reader routes each response line
//! to whichever caller registered that id; response order is irrelevant.
//! Stdout lines that are not JSON objects/arrays are treated as incidental
//! logging and skipped.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::TransportError;
use super::lifecycle::{self, KillSwitch, ProcessSpec, StderrTail};
use super::pending::{CallOutcome, LinkState, PendingCalls};
use super::types::{
    tools_from_payload, ConnectionState, TransportSettings, WireRequest, WireResponse,
};

/// Grace period for draining stdout after the process has exited.
const EXIT_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(100);

// ─── PipeClient ──────────────────────────────────────────────────────────────

/// Transport client for a backend running as a child process.
pub struct PipeClient {
    backend_id: String,
    spec: ProcessSpec,
    settings: TransportSettings,
    link: Arc<LinkState>,
    connection: Mutex<Option<PipeConnection>>,
}

/// Everything tied to one spawned process.
struct PipeConnection {
    pending: Arc<PendingCalls>,
    writer: Arc<Mutex<ChildStdin>>,
    stderr_tail: StderrTail,
    kill_switch: KillSwitch,
    reader: JoinHandle<()>,
}

impl PipeConnection {
    fn close(mut self) {
        self.reader.abort();
        self.pending.fail_all();
        self.kill_switch.kill();
    }
}

impl PipeClient {
    pub fn new(backend_id: &str, spec: ProcessSpec, settings: TransportSettings) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            spec,
            settings,
            link: Arc::new(LinkState::new()),
            connection: Mutex::new(None),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn state(&self) -> ConnectionState {
        self.link.current()
    }

    /// Number of calls currently awaiting a response.
    pub async fn pending_count(&self) -> usize {
        let guard = self.connection.lock().await;
        guard.as_ref().map(|c| c.pending.len()).unwrap_or(0)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the process and perform the `list_tools` handshake.
    ///
    /// No-op when already connected. The whole sequence is bounded by the
    /// startup timeout.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut guard = self.connection.lock().await;
        if self.link.is_connected() && guard.is_some() {
            return Ok(());
        }

        // A previous process may have exited behind our back.
        if let Some(stale) = guard.take() {
            stale.close();
        }

        let generation = self.link.begin_connect();
        let connection = match self.spawn_connection(generation) {
            Ok(c) => c,
            Err(e) => {
                self.link.set(generation, ConnectionState::Error);
                return Err(e);
            }
        };

        let handshake = send_request(
            &self.backend_id,
            &connection.pending,
            &connection.writer,
            WireRequest::list_tools(),
            "list_tools",
            self.settings.startup_timeout,
        )
        .await;

        match handshake {
            Ok(_) => {
                self.link.set(generation, ConnectionState::Connected);
                *guard = Some(connection);
                tracing::info!(backend = %self.backend_id, "pipe backend connected");
                Ok(())
            }
            Err(e) => {
                let suffix = connection.stderr_tail.error_suffix();
                connection.close();
                self.link.set(generation, ConnectionState::Error);
                let reason = match e {
                    TransportError::Timeout { timeout_ms, .. } => {
                        format!("startup handshake timed out after {timeout_ms}ms{suffix}")
                    }
                    other => format!("startup handshake failed: {other}{suffix}"),
                };
                tracing::warn!(backend = %self.backend_id, reason = %reason, "pipe connect failed");
                Err(TransportError::Connection {
                    backend: self.backend_id.clone(),
                    reason,
                })
            }
        }
    }

    /// Kill the process and reject every outstanding call.
    pub async fn disconnect(&self) {
        let mut guard = self.connection.lock().await;
        self.link.reset();
        if let Some(connection) = guard.take() {
            connection.close();
            tracing::info!(backend = %self.backend_id, "pipe backend disconnected");
        }
    }

    fn spawn_connection(&self, generation: u64) -> Result<PipeConnection, TransportError> {
        let mut process = lifecycle::spawn_process(&self.backend_id, &self.spec)?;
        let pending = Arc::new(PendingCalls::new(&self.backend_id));
        let kill_switch = process.take_kill_switch();

        let reader = tokio::spawn(read_responses(
            self.backend_id.clone(),
            process.stdout,
            Arc::clone(&pending),
            Arc::clone(&self.link),
            generation,
            process.exited,
        ));

        Ok(PipeConnection {
            pending,
            writer: Arc::new(Mutex::new(process.stdin)),
            stderr_tail: process.stderr_tail,
            kill_switch,
            reader,
        })
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Clone the channel handles without holding the connection lock
    /// across the call.
    async fn channel(
        &self,
    ) -> Result<(Arc<PendingCalls>, Arc<Mutex<ChildStdin>>), TransportError> {
        let guard = self.connection.lock().await;
        match guard.as_ref() {
            Some(c) if self.link.is_connected() => {
                Ok((Arc::clone(&c.pending), Arc::clone(&c.writer)))
            }
            _ => Err(TransportError::NotConnected {
                backend: self.backend_id.clone(),
            }),
        }
    }

    /// Ask the backend for its raw tool metadata.
    pub async fn list_tools(&self) -> Result<Vec<serde_json::Value>, TransportError> {
        let (pending, writer) = self.channel().await?;
        let payload = send_request(
            &self.backend_id,
            &pending,
            &writer,
            WireRequest::list_tools(),
            "list_tools",
            self.settings.call_timeout,
        )
        .await?;
        tools_from_payload(&self.backend_id, payload)
    }

    /// Invoke a tool and wait for its correlated response.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let (pending, writer) = self.channel().await?;
        send_request(
            &self.backend_id,
            &pending,
            &writer,
            WireRequest::call_tool(name, arguments),
            name,
            self.settings.call_timeout,
        )
        .await
    }
}

// ─── Wire I/O ────────────────────────────────────────────────────────────────

/// Register, write one line, then wait for the correlated response.
async fn send_request(
    backend: &str,
    pending: &Arc<PendingCalls>,
    writer: &Mutex<ChildStdin>,
    request: WireRequest,
    label: &str,
    timeout: std::time::Duration,
) -> CallOutcome {
    let slot = pending.register(&request.id, label)?;

    let mut line = serde_json::to_string(&request).map_err(|e| TransportError::Protocol {
        backend: backend.to_string(),
        reason: format!("failed to serialize request: {e}"),
    })?;
    line.push('\n');

    {
        let mut stdin = writer.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Protocol {
                backend: backend.to_string(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        stdin.flush().await.map_err(|e| TransportError::Protocol {
            backend: backend.to_string(),
            reason: format!("failed to flush stdin: {e}"),
        })?;
    }

    tracing::debug!(
        backend,
        correlation_id = %slot.id(),
        action = label,
        "sent pipe request"
    );
    slot.wait(timeout).await
}

/// Route stdout lines to pending calls until the process goes away.
async fn read_responses(
    backend: String,
    stdout: ChildStdout,
    pending: Arc<PendingCalls>,
    link: Arc<LinkState>,
    generation: u64,
    mut exited: oneshot::Receiver<String>,
) {
    // Raw segments: a log line in a legacy encoding must not end the stream.
    let mut lines = BufReader::new(stdout).split(b'\n');

    let reason = loop {
        tokio::select! {
            line = lines.next_segment() => match line {
                Ok(Some(line)) => handle_line(&backend, &pending, &String::from_utf8_lossy(&line)),
                Ok(None) => break "stdout closed".to_string(),
                Err(e) => break format!("failed to read stdout: {e}"),
            },
            exit = &mut exited => {
                // Pick up anything the process wrote right before exiting.
                while let Ok(Ok(Some(line))) =
                    tokio::time::timeout(EXIT_DRAIN_TIMEOUT, lines.next_segment()).await
                {
                    handle_line(&backend, &pending, &String::from_utf8_lossy(&line));
                }
                break exit.unwrap_or_else(|_| "process watcher gone".to_string());
            }
        }
    };

    if link.set(generation, ConnectionState::Disconnected) {
        tracing::warn!(backend = %backend, reason = %reason, "pipe backend terminated");
    }
    pending.fail_all();
}

/// Whether a stdout line is a candidate protocol message.
fn looks_like_json(line: &str) -> bool {
    (line.starts_with('{') && line.ends_with('}'))
        || (line.starts_with('[') && line.ends_with(']'))
}

fn handle_line(backend: &str, pending: &PendingCalls, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    if !looks_like_json(trimmed) {
        tracing::debug!(backend, line = %trimmed, "ignoring non-protocol output");
        return;
    }

    let responses = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<WireResponse>>(trimmed)
    } else {
        serde_json::from_str::<WireResponse>(trimmed).map(|r| vec![r])
    };

    match responses {
        Ok(responses) => {
            for response in responses {
                let id = response.id.clone();
                if !pending.resolve(response) {
                    tracing::warn!(
                        backend,
                        correlation_id = %id,
                        "dropping response with no matching pending call"
                    );
                }
            }
        }
        Err(e) => {
            tracing::debug!(backend, error = %e, "JSON line is not a protocol response");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
