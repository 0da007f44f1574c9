//! Shared types for the transport layer.
//!
//! Backend descriptors, connection states and the line/event wire protocol
//! shared by the pipe and stream variants.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::TransportError;

// ─── Backend Descriptor ─────────────────────────────────────────────────────

/// Transport kinds a backend can be reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process speaking line-delimited JSON over stdio.
    Pipe,
    /// Server-sent event channel plus HTTP requests.
    Stream,
    /// Store-backed fake with deterministic results.
    Simulated,
}

impl TransportKind {
    /// Parse a descriptor's `transportKind` string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pipe" | "stdio" => Some(Self::Pipe),
            "stream" | "sse" => Some(Self::Stream),
            "simulated" => Some(Self::Simulated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pipe => "pipe",
            Self::Stream => "stream",
            Self::Simulated => "simulated",
        }
    }
}

/// A configured backend, immutable for the process lifetime.
///
/// `transport_kind` stays a raw string so an unsupported value reaches the
/// factory instead of failing the whole configuration parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    pub id: String,
    #[serde(alias = "transport_kind", alias = "type")]
    pub transport_kind: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "api_key")]
    pub api_key: Option<String>,
    /// Extra environment for pipe backends.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for pipe backends.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Artificial latency override for simulated backends.
    #[serde(default, alias = "latency_ms")]
    pub latency_ms: Option<u64>,
}

impl BackendDescriptor {
    /// Minimal descriptor with only an id and kind set.
    pub fn new(id: &str, transport_kind: &str) -> Self {
        Self {
            id: id.to_string(),
            transport_kind: transport_kind.to_string(),
            command: None,
            args: Vec::new(),
            url: None,
            api_key: None,
            env: HashMap::new(),
            cwd: None,
            latency_ms: None,
        }
    }
}

// ─── Connection State ───────────────────────────────────────────────────────

/// Lifecycle state of a transport client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

// ─── Settings ───────────────────────────────────────────────────────────────

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default stream connection-establishment deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pipe startup window (spawn + handshake).
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default artificial latency for simulated calls.
pub const DEFAULT_SIMULATED_LATENCY: Duration = Duration::from_millis(150);

/// Timeouts shared by every client the factory builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
    pub startup_timeout: Duration,
    pub simulated_latency: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            simulated_latency: DEFAULT_SIMULATED_LATENCY,
        }
    }
}

// ─── Wire Protocol ──────────────────────────────────────────────────────────

/// Action names understood by pipe and stream backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireAction {
    ListTools,
    CallTool,
}

/// Outbound request: one JSON object per line (pipe) or per POST (stream).
#[derive(Debug, Clone, Serialize)]
pub struct WireRequest {
    pub id: String,
    pub action: WireAction,
    pub data: serde_json::Value,
}

impl WireRequest {
    /// A `list_tools` request with a fresh correlation id.
    pub fn list_tools() -> Self {
        Self {
            id: new_correlation_id(),
            action: WireAction::ListTools,
            data: serde_json::json!({}),
        }
    }

    /// A `call_tool` request with a fresh correlation id.
    pub fn call_tool(name: &str, arguments: serde_json::Value) -> Self {
        Self {
            id: new_correlation_id(),
            action: WireAction::CallTool,
            data: serde_json::json!({
                "name": name,
                "arguments": arguments,
            }),
        }
    }
}

/// Inbound response: `{ id, data?, error? }`.
#[derive(Debug, Clone, Deserialize)]
pub struct WireResponse {
    pub id: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl WireResponse {
    /// Convert into a call outcome, attributing failures to `tool`.
    pub fn into_outcome(
        self,
        backend: &str,
        tool: &str,
    ) -> Result<serde_json::Value, TransportError> {
        match self.error {
            Some(serde_json::Value::Null) | None => {
                Ok(self.data.unwrap_or(serde_json::Value::Null))
            }
            Some(serde_json::Value::String(message)) => Err(TransportError::Execution {
                backend: backend.to_string(),
                tool: tool.to_string(),
                message,
            }),
            Some(other) => {
                let message = other
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| other.to_string());
                Err(TransportError::Execution {
                    backend: backend.to_string(),
                    tool: tool.to_string(),
                    message,
                })
            }
        }
    }
}

/// Generate a fresh correlation id.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Extract the raw tool list from a `list_tools` payload.
///
/// Accepts either `{"tools": [...]}` or a bare array.
pub fn tools_from_payload(
    backend: &str,
    payload: serde_json::Value,
) -> Result<Vec<serde_json::Value>, TransportError> {
    match payload {
        serde_json::Value::Array(tools) => Ok(tools),
        serde_json::Value::Object(mut obj) => match obj.remove("tools") {
            Some(serde_json::Value::Array(tools)) => Ok(tools),
            _ => Err(TransportError::Protocol {
                backend: backend.to_string(),
                reason: "list_tools response has no 'tools' array".into(),
            }),
        },
        other => Err(TransportError::Protocol {
            backend: backend.to_string(),
            reason: format!("unexpected list_tools payload: {other}"),
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
