//! Row types persisted by [`super::BridgeDatabase`].

use serde::{Deserialize, Serialize};

// ─── Consent ────────────────────────────────────────────────────────────────

/// Per-user authorization for one backend tool.
///
/// Anonymous callers are stored under the empty user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecord {
    pub user_id: String,
    pub backend_id: String,
    pub tool_name: String,
    pub granted: bool,
    pub updated_at: String,
}

// ─── Executions ─────────────────────────────────────────────────────────────

/// Lifecycle status of an [`ExecutionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Success,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Persisted trace of one dispatched call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub call_id: String,
    pub backend_id: String,
    pub tool_name: String,
    pub user_id: Option<String>,
    pub arguments: serde_json::Value,
    pub status: ExecutionStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub execution_time_ms: Option<u64>,
}

// ─── Simulated Backend ──────────────────────────────────────────────────────

/// A tool advertised by a simulated backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedTool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl SimulatedTool {
    /// Raw `list_tools` entry, same shape a live backend returns.
    pub fn to_raw(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }
}

/// One logged call against a simulated backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedCall {
    pub id: i64,
    pub backend_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: String,
}
