//! Pending-call bookkeeping shared by the pipe and stream clients.
//!
//! Responses are matched to callers purely by correlation id. Whoever removes
//! an entry from the map (response, deadline, disconnect, or a dropped caller)
//! settles that call; every other path finds nothing and backs off.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use super::errors::TransportError;
use super::types::{ConnectionState, WireResponse};

/// Result delivered to a waiting caller.
pub type CallOutcome = Result<serde_json::Value, TransportError>;

struct PendingEntry {
    tool: String,
    tx: oneshot::Sender<CallOutcome>,
}

// ─── PendingCalls ───────────────────────────────────────────────────────────

#[derive(Default)]
struct CallMap {
    entries: HashMap<String, PendingEntry>,
    /// Set once the connection is gone; later registrations fail fast.
    closed: bool,
}

/// In-flight calls for one connection, keyed by correlation id.
pub struct PendingCalls {
    backend: String,
    calls: Mutex<CallMap>,
}

impl PendingCalls {
    pub fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            calls: Mutex::new(CallMap::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CallMap> {
        // A poisoned map is still structurally sound: entries are only ever
        // inserted or removed whole.
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a call. At most one entry may exist per correlation id.
    pub fn register(
        self: &Arc<Self>,
        id: &str,
        tool: &str,
    ) -> Result<PendingSlot, TransportError> {
        let (tx, rx) = oneshot::channel();
        let mut calls = self.lock();
        if calls.closed {
            return Err(TransportError::Disconnected {
                backend: self.backend.clone(),
            });
        }
        if calls.entries.contains_key(id) {
            return Err(TransportError::Protocol {
                backend: self.backend.clone(),
                reason: format!("duplicate correlation id '{id}'"),
            });
        }
        calls.entries.insert(
            id.to_string(),
            PendingEntry {
                tool: tool.to_string(),
                tx,
            },
        );
        Ok(PendingSlot {
            pending: Arc::clone(self),
            id: id.to_string(),
            tool: tool.to_string(),
            rx: Some(rx),
        })
    }

    /// Settle the call matching `response.id`.
    ///
    /// Returns `false` when no call is waiting for that id.
    pub fn resolve(&self, response: WireResponse) -> bool {
        let entry = self.lock().entries.remove(&response.id);
        match entry {
            Some(entry) => {
                let outcome = response.into_outcome(&self.backend, &entry.tool);
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail a single call without waiting for a response.
    pub fn reject(&self, id: &str, error: TransportError) -> bool {
        match self.lock().entries.remove(id) {
            Some(entry) => {
                let _ = entry.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Remove a call without delivering anything.
    fn cancel(&self, id: &str) -> bool {
        self.lock().entries.remove(id).is_some()
    }

    /// Reject every outstanding call with `Disconnected` and refuse new ones.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut calls = self.lock();
            calls.closed = true;
            calls.entries.drain().map(|(_, e)| e).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(TransportError::Disconnected {
                backend: self.backend.clone(),
            }));
        }
        if count > 0 {
            tracing::warn!(
                backend = %self.backend,
                count,
                "rejected outstanding calls on disconnect"
            );
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

// ─── PendingSlot ────────────────────────────────────────────────────────────

/// A caller's handle on one registered call.
///
/// Dropping the slot before it settles removes the map entry, so an
/// abandoned caller never leaves a stale correlation id behind.
pub struct PendingSlot {
    pending: Arc<PendingCalls>,
    id: String,
    tool: String,
    rx: Option<oneshot::Receiver<CallOutcome>>,
}

impl PendingSlot {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the outcome or for this call's own deadline.
    pub async fn wait(mut self, timeout: Duration) -> CallOutcome {
        let backend = self.pending.backend.clone();
        let Some(mut rx) = self.rx.take() else {
            return Err(TransportError::Disconnected { backend });
        };

        tokio::select! {
            received = &mut rx => {
                received.unwrap_or(Err(TransportError::Disconnected { backend }))
            }
            _ = tokio::time::sleep(timeout) => {
                if self.pending.cancel(&self.id) {
                    tracing::warn!(
                        backend = %backend,
                        tool = %self.tool,
                        correlation_id = %self.id,
                        timeout_ms = timeout.as_millis() as u64,
                        "call timed out"
                    );
                    Err(TransportError::Timeout {
                        backend,
                        tool: self.tool.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                } else {
                    // Settled concurrently with the deadline; the sender has
                    // already fired or been dropped.
                    rx.await
                        .unwrap_or(Err(TransportError::Disconnected { backend }))
                }
            }
        }
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.pending.cancel(&self.id);
    }
}

// ─── LinkState ──────────────────────────────────────────────────────────────

/// Connection state plus a generation counter.
///
/// Each `connect()` attempt bumps the generation; background tasks tied to an
/// older connection can then no longer overwrite the state of a newer one.
pub struct LinkState {
    inner: Mutex<(ConnectionState, u64)>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((ConnectionState::Disconnected, 0)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (ConnectionState, u64)> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current(&self) -> ConnectionState {
        self.lock().0
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    /// Start a new attempt; returns its generation.
    pub fn begin_connect(&self) -> u64 {
        let mut guard = self.lock();
        guard.1 += 1;
        guard.0 = ConnectionState::Connecting;
        guard.1
    }

    /// Set the state if `generation` is still current.
    pub fn set(&self, generation: u64, state: ConnectionState) -> bool {
        let mut guard = self.lock();
        if guard.1 != generation {
            return false;
        }
        guard.0 = state;
        true
    }

    /// Unconditionally move to `Disconnected`, retiring the current generation.
    pub fn reset(&self) {
        let mut guard = self.lock();
        guard.1 += 1;
        guard.0 = ConnectionState::Disconnected;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: &str, data: serde_json::Value) -> WireResponse {
        WireResponse {
            id: id.to_string(),
            data: Some(data),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_resolve_delivers_to_matching_slot() {
        let pending = Arc::new(PendingCalls::new("srv"));
        let a = pending.register("a", "tool_a").unwrap();
        let b = pending.register("b", "tool_b").unwrap();

        // Deliver out of order.
        assert!(pending.resolve(response("b", serde_json::json!({"n": 2}))));
        assert!(pending.resolve(response("a", serde_json::json!({"n": 1}))));

        let rb = b.wait(Duration::from_secs(1)).await.unwrap();
        let ra = a.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ra["n"], 1);
        assert_eq!(rb["n"], 2);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_response_is_reported() {
        let pending = Arc::new(PendingCalls::new("srv"));
        assert!(!pending.resolve(response("ghost", serde_json::json!({}))));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let pending = Arc::new(PendingCalls::new("srv"));
        let _slot = pending.register("dup", "t").unwrap();
        assert!(pending.register("dup", "t").is_err());
    }

    #[tokio::test]
    async fn test_timeout_removes_only_its_entry() {
        let pending = Arc::new(PendingCalls::new("srv"));
        let slow = pending.register("slow", "slow_tool").unwrap();
        let fast = pending.register("fast", "fast_tool").unwrap();

        let err = slow.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { ref tool, .. } if tool == "slow_tool"));
        assert_eq!(pending.len(), 1);

        // A late response for the timed-out call finds nothing.
        assert!(!pending.resolve(response("slow", serde_json::json!({}))));
        assert!(pending.resolve(response("fast", serde_json::json!({"ok": true}))));
        assert_eq!(fast.wait(Duration::from_secs(1)).await.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_fail_all_rejects_with_disconnected() {
        let pending = Arc::new(PendingCalls::new("srv"));
        let a = pending.register("a", "t").unwrap();
        let b = pending.register("b", "t").unwrap();

        assert_eq!(pending.fail_all(), 2);
        assert!(matches!(
            a.wait(Duration::from_secs(5)).await,
            Err(TransportError::Disconnected { .. })
        ));
        assert!(matches!(
            b.wait(Duration::from_secs(5)).await,
            Err(TransportError::Disconnected { .. })
        ));
        assert!(matches!(
            pending.register("late", "t"),
            Err(TransportError::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_slot_cleans_up() {
        let pending = Arc::new(PendingCalls::new("srv"));
        let slot = pending.register("x", "t").unwrap();
        assert_eq!(pending.len(), 1);
        drop(slot);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_link_state_generation_guard() {
        let link = LinkState::new();
        let first = link.begin_connect();
        assert_eq!(link.current(), ConnectionState::Connecting);
        let second = link.begin_connect();
        assert!(!link.set(first, ConnectionState::Connected));
        assert!(link.set(second, ConnectionState::Connected));
        assert!(link.is_connected());
        link.reset();
        assert_eq!(link.current(), ConnectionState::Disconnected);
        assert!(!link.set(second, ConnectionState::Error));
    }
}
