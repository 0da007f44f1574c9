//! Transport error types.

use thiserror::Error;

/// Errors that can occur while talking to a tool backend.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Bad or incomplete backend descriptor. Fatal for that backend only.
    #[error("configuration error for backend '{backend}': {reason}")]
    Configuration {
        backend: String,
        reason: String,
    },

    /// The process or socket could not be established.
    #[error("failed to connect to backend '{backend}': {reason}")]
    Connection {
        backend: String,
        reason: String,
    },

    /// An operation was attempted before `connect()` succeeded.
    #[error("backend '{backend}' is not connected")]
    NotConnected {
        backend: String,
    },

    /// The client was disconnected while the call was outstanding.
    #[error("backend '{backend}' disconnected")]
    Disconnected {
        backend: String,
    },

    /// A single call exceeded its deadline.
    #[error("call '{tool}' on backend '{backend}' timed out after {timeout_ms}ms")]
    Timeout {
        backend: String,
        tool: String,
        timeout_ms: u64,
    },

    /// The backend reported a failure for the call.
    #[error("tool '{tool}' on backend '{backend}' failed: {message}")]
    Execution {
        backend: String,
        tool: String,
        message: String,
    },

    /// Malformed message or I/O failure on an established channel.
    #[error("protocol error for backend '{backend}': {reason}")]
    Protocol {
        backend: String,
        reason: String,
    },
}

impl TransportError {
    /// The backend this error originated from.
    pub fn backend(&self) -> &str {
        match self {
            Self::Configuration { backend, .. }
            | Self::Connection { backend, .. }
            | Self::NotConnected { backend }
            | Self::Disconnected { backend }
            | Self::Timeout { backend, .. }
            | Self::Execution { backend, .. }
            | Self::Protocol { backend, .. } => backend,
        }
    }

    /// Whether the failure means the backend channel is unusable.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::NotConnected { .. } | Self::Disconnected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_accessor() {
        let err = TransportError::Timeout {
            backend: "srv1".into(),
            tool: "calculator".into(),
            timeout_ms: 30_000,
        };
        assert_eq!(err.backend(), "srv1");
        assert!(err.to_string().contains("30000ms"));
    }

    #[test]
    fn test_link_failures() {
        assert!(TransportError::Disconnected { backend: "a".into() }.is_link_failure());
        assert!(TransportError::NotConnected { backend: "a".into() }.is_link_failure());
        assert!(!TransportError::Execution {
            backend: "a".into(),
            tool: "t".into(),
            message: "boom".into(),
        }
        .is_link_failure());
    }
}
