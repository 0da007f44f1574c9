//! Transport layer: the three backend client kinds and tool discovery.
//!
//! This module handles:
//! - Spawning pipe backends and speaking line-delimited JSON over stdio
//! - Stream backends reached through an SSE channel plus HTTP POSTs
//! - Store-backed simulated backends
//! - Correlating concurrent requests and responses by id
//! - Building clients from descriptors and collecting their tools into a registry

pub mod client;
pub mod discovery;
pub mod errors;
pub mod factory;
pub mod lifecycle;
pub mod pending;
pub mod pipe;
pub mod registry;
pub mod simulated;
pub mod sse;
pub mod stream;
pub mod types;

// Re-exports for convenience
pub use client::TransportClient;
pub use discovery::{discover, BackendFailure, DiscoveryReport};
pub use errors::TransportError;
pub use factory::{build_client, ClientFactory};
pub use registry::{encode_public_name, SkippedTool, ToolDefinition, ToolRegistry};
pub use types::{BackendDescriptor, ConnectionState, TransportKind, TransportSettings};
