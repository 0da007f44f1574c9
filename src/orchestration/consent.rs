//! Consent gate: per-user authorization for backend tools.
//!
//! A call is allowed only when a consent record with `granted = true` exists
//! for the exact (user, backend, tool) key. Missing records and store
//! failures both deny. The `allow_all` override exists for local development
//! and is logged loudly whenever it applies.

use crate::storage::database::{lock, SharedDatabase};
use crate::storage::{ConsentRecord, StoreError};

/// Key used for callers without a user id.
const ANONYMOUS_USER: &str = "";

pub struct ConsentGate {
    db: SharedDatabase,
    allow_all: bool,
}

impl ConsentGate {
    pub fn new(db: SharedDatabase, allow_all: bool) -> Self {
        if allow_all {
            tracing::warn!("consent gate override active: every tool call is allowed without a consent record");
        }
        Self { db, allow_all }
    }

    pub fn allows_all(&self) -> bool {
        self.allow_all
    }

    /// Whether `user_id` may call `tool_name` on `backend_id`.
    pub fn authorize(&self, user_id: Option<&str>, backend_id: &str, tool_name: &str) -> bool {
        if self.allow_all {
            tracing::warn!(
                backend = backend_id,
                tool = tool_name,
                user = user_id.unwrap_or(ANONYMOUS_USER),
                "consent check bypassed by allow-all override"
            );
            return true;
        }

        let user = user_id.unwrap_or(ANONYMOUS_USER);
        match lock(&self.db).get_consent(user, backend_id, tool_name) {
            Ok(Some(record)) => record.granted,
            Ok(None) => {
                tracing::debug!(backend = backend_id, tool = tool_name, user, "no consent record");
                false
            }
            Err(e) => {
                tracing::warn!(
                    backend = backend_id,
                    tool = tool_name,
                    error = %e,
                    "consent lookup failed, denying"
                );
                false
            }
        }
    }

    pub fn grant(
        &self,
        user_id: Option<&str>,
        backend_id: &str,
        tool_name: &str,
    ) -> Result<(), StoreError> {
        lock(&self.db).set_consent(user_id.unwrap_or(ANONYMOUS_USER), backend_id, tool_name, true)
    }

    /// Record an explicit refusal. Denies exactly like a missing record.
    pub fn revoke(
        &self,
        user_id: Option<&str>,
        backend_id: &str,
        tool_name: &str,
    ) -> Result<(), StoreError> {
        lock(&self.db).set_consent(
            user_id.unwrap_or(ANONYMOUS_USER),
            backend_id,
            tool_name,
            false,
        )
    }

    pub fn records_for(&self, user_id: Option<&str>) -> Result<Vec<ConsentRecord>, StoreError> {
        lock(&self.db).list_consents(user_id.unwrap_or(ANONYMOUS_USER))
    }
}
