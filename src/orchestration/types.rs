//! Types exchanged with the LLM bridge.

use serde::{Deserialize, Serialize};

use crate::transport::{ConnectionState, TransportKind};

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Bridge-assigned id, echoed back on the output.
    pub call_id: String,
    /// Public tool name.
    pub name: String,
    /// Raw JSON argument string, exactly as the model produced it.
    pub arguments: String,
}

/// One output per requested call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    #[serde(rename = "tool_call_id")]
    pub call_id: String,
    /// JSON string: the raw tool result or `{"error": "..."}`.
    pub output: String,
}

/// Snapshot of one configured backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub backend_id: String,
    pub kind: TransportKind,
    pub state: ConnectionState,
    pub tools: usize,
}
