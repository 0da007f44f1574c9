//! Dispatch error types.
//!
//! None of these escape the adapter as `Err`; each is rendered into a
//! `{"error": "..."}` payload for the LLM bridge.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors that can occur while dispatching one tool call.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The argument string is not valid JSON or misses required fields.
    #[error("invalid arguments for tool '{tool}': {reason}")]
    BadArguments { tool: String, reason: String },

    /// No tool is registered under this public name.
    #[error("tool not found: '{name}'")]
    ToolNotFound { name: String },

    /// The consent gate refused the call.
    #[error("consent denied for tool '{tool}' on backend '{backend}'")]
    ConsentDenied { backend: String, tool: String },

    /// The backend call itself failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DispatchError {
    /// Short machine-readable category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadArguments { .. } => "bad_arguments",
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::ConsentDenied { .. } => "consent_denied",
            Self::Transport(TransportError::Configuration { .. }) => "configuration",
            Self::Transport(TransportError::Connection { .. }) => "connection",
            Self::Transport(TransportError::NotConnected { .. }) => "not_connected",
            Self::Transport(TransportError::Disconnected { .. }) => "disconnected",
            Self::Transport(TransportError::Timeout { .. }) => "timeout",
            Self::Transport(TransportError::Execution { .. }) => "execution",
            Self::Transport(TransportError::Protocol { .. }) => "protocol",
        }
    }

    /// The structured payload returned to the LLM bridge.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let err = DispatchError::ToolNotFound {
            name: "does_not_exist".into(),
        };
        let payload = err.to_payload();
        assert_eq!(payload["error"], "tool not found: 'does_not_exist'");
        assert_eq!(err.kind(), "tool_not_found");
    }

    #[test]
    fn test_transport_error_is_transparent() {
        let err: DispatchError = TransportError::Timeout {
            backend: "srv1".into(),
            tool: "slow".into(),
            timeout_ms: 30_000,
        }
        .into();
        assert!(err.to_string().starts_with("call 'slow' on backend 'srv1' timed out"));
        assert_eq!(err.kind(), "timeout");
    }
}
