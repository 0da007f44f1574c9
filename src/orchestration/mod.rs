//! Orchestration layer: the surface the LLM bridge consumes.
//!
//! This module handles:
//! - Resolving public tool names back to (backend, tool)
//! - Per-user consent checks before any backend is touched
//! - Execution records for every call that reaches the consent gate
//! - Turning every failure into a structured error payload

pub mod adapter;
pub mod audit;
pub mod consent;
pub mod errors;
pub mod types;

// Re-exports for convenience
pub use adapter::OrchestrationAdapter;
pub use audit::{AuditLog, ExecutionContext, PendingExecution};
pub use consent::ConsentGate;
pub use errors::DispatchError;
pub use types::{BackendStatus, ToolCallRequest, ToolOutput};
