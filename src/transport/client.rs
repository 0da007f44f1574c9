//! The polymorphic transport client.
//!
//! One variant per transport kind; each exposes the same four-operation
//! capability (`connect`, `disconnect`, `list_tools`, `call_tool`).

use super::errors::TransportError;
use super::pipe::PipeClient;
use super::simulated::SimulatedClient;
use super::stream::StreamClient;
use super::types::{ConnectionState, TransportKind};

pub enum TransportClient {
    Pipe(PipeClient),
    Stream(StreamClient),
    Simulated(SimulatedClient),
}

impl TransportClient {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Pipe(_) => TransportKind::Pipe,
            Self::Stream(_) => TransportKind::Stream,
            Self::Simulated(_) => TransportKind::Simulated,
        }
    }

    pub fn backend_id(&self) -> &str {
        match self {
            Self::Pipe(c) => c.backend_id(),
            Self::Stream(c) => c.backend_id(),
            Self::Simulated(c) => c.backend_id(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            Self::Pipe(c) => c.state(),
            Self::Stream(c) => c.state(),
            Self::Simulated(c) => c.state(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Establish the underlying channel. Idempotent when connected.
    pub async fn connect(&self) -> Result<(), TransportError> {
        match self {
            Self::Pipe(c) => c.connect().await,
            Self::Stream(c) => c.connect().await,
            Self::Simulated(c) => c.connect().await,
        }
    }

    /// Release the channel and reject outstanding calls with `Disconnected`.
    pub async fn disconnect(&self) {
        match self {
            Self::Pipe(c) => c.disconnect().await,
            Self::Stream(c) => c.disconnect().await,
            Self::Simulated(c) => c.disconnect().await,
        }
    }

    /// Raw tool metadata as reported by the backend.
    pub async fn list_tools(&self) -> Result<Vec<serde_json::Value>, TransportError> {
        match self {
            Self::Pipe(c) => c.list_tools().await,
            Self::Stream(c) => c.list_tools().await,
            Self::Simulated(c) => c.list_tools().await,
        }
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        match self {
            Self::Pipe(c) => c.call_tool(name, arguments).await,
            Self::Stream(c) => c.call_tool(name, arguments).await,
            Self::Simulated(c) => c.call_tool(name, arguments).await,
        }
    }
}
