//! Audit log: one execution record per dispatched call.
//!
//! Records are inserted as `pending` before the backend is called and moved
//! to `success` or `error` afterwards. Store failures are logged and never
//! block the call.

use std::time::Instant;

use crate::storage::database::{lock, SharedDatabase};
use crate::storage::{ExecutionRecord, ExecutionStatus, StoreError};

/// Handle on a record that is still `pending`.
#[derive(Debug)]
pub struct PendingExecution {
    id: String,
    started: Instant,
}

impl PendingExecution {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Who called what, with which arguments.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub call_id: &'a str,
    pub backend_id: &'a str,
    pub tool_name: &'a str,
    pub user_id: Option<&'a str>,
    pub arguments: &'a serde_json::Value,
}

impl ExecutionContext<'_> {
    fn record(&self, status: ExecutionStatus) -> ExecutionRecord {
        ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            call_id: self.call_id.to_string(),
            backend_id: self.backend_id.to_string(),
            tool_name: self.tool_name.to_string(),
            user_id: self.user_id.map(String::from),
            arguments: self.arguments.clone(),
            status,
            result: None,
            error: None,
            started_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
            execution_time_ms: None,
        }
    }
}

pub struct AuditLog {
    db: SharedDatabase,
}

impl AuditLog {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Write a `pending` record. Returns `None` if the store rejected it.
    pub fn begin(&self, ctx: ExecutionContext<'_>) -> Option<PendingExecution> {
        let record = ctx.record(ExecutionStatus::Pending);
        match lock(&self.db).insert_execution(&record) {
            Ok(()) => Some(PendingExecution {
                id: record.id,
                started: Instant::now(),
            }),
            Err(e) => {
                tracing::error!(
                    call_id = ctx.call_id,
                    tool = ctx.tool_name,
                    error = %e,
                    "failed to write execution record"
                );
                None
            }
        }
    }

    pub fn complete_success(&self, pending: &PendingExecution, result: &serde_json::Value) {
        self.complete(pending, ExecutionStatus::Success, Some(result), None);
    }

    pub fn complete_error(&self, pending: &PendingExecution, message: &str) {
        self.complete(pending, ExecutionStatus::Error, None, Some(message));
    }

    fn complete(
        &self,
        pending: &PendingExecution,
        status: ExecutionStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) {
        let elapsed_ms = pending.started.elapsed().as_millis() as u64;
        match lock(&self.db).complete_execution(&pending.id, status, result, error, elapsed_ms) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                execution_id = %pending.id,
                "execution record was no longer pending"
            ),
            Err(e) => tracing::error!(
                execution_id = %pending.id,
                error = %e,
                "failed to complete execution record"
            ),
        }
    }

    /// Write a terminal `error` record for a call that never reached the
    /// backend.
    pub fn record_denied(&self, ctx: ExecutionContext<'_>, message: &str) {
        let mut record = ctx.record(ExecutionStatus::Error);
        record.error = Some(message.to_string());
        record.completed_at = Some(record.started_at.clone());
        record.execution_time_ms = Some(0);
        if let Err(e) = lock(&self.db).insert_execution(&record) {
            tracing::error!(
                call_id = ctx.call_id,
                tool = ctx.tool_name,
                error = %e,
                "failed to write denied execution record"
            );
        }
    }

    pub fn for_call(&self, call_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        lock(&self.db).executions_for_call(call_id)
    }

    pub fn by_status(&self, status: ExecutionStatus) -> Result<Vec<ExecutionRecord>, StoreError> {
        lock(&self.db).executions_by_status(status)
    }
}
