//! OrchestrationAdapter: the facade the LLM bridge talks to.
//!
//! The adapter owns the transport clients and the tool registry. It handles:
//! - Discovery (rebuild the registry, then swap it in whole)
//! - Serving cached tool schemas without any I/O
//! - Dispatch: parse → resolve → consent → audit → execute → audit
//! - Batch dispatch with one output per requested call
//!
//! Business-logic failures never escape as `Err`; they become
//! `{"error": "..."}` payloads so the bridge always has an output to send.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use futures::future::join_all;

use crate::config::OrchestratorConfig;
use crate::storage::SharedDatabase;
use crate::transport::{
    discover, BackendFailure, ClientFactory, DiscoveryReport, ToolRegistry, TransportClient,
    TransportError,
};

use super::audit::{AuditLog, ExecutionContext};
use super::consent::ConsentGate;
use super::errors::DispatchError;
use super::types::{BackendStatus, ToolCallRequest, ToolOutput};

// ─── OrchestrationAdapter ───────────────────────────────────────────────────

pub struct OrchestrationAdapter {
    /// Clients in configuration order.
    clients: Vec<Arc<TransportClient>>,
    by_backend: HashMap<String, Arc<TransportClient>>,
    /// Replaced wholesale on every discovery pass.
    registry: RwLock<Arc<ToolRegistry>>,
    enabled_tools: Option<HashSet<String>>,
    consent: ConsentGate,
    audit: AuditLog,
    config_failures: Vec<BackendFailure>,
}

impl OrchestrationAdapter {
    /// Wrap already-built clients. Later clients reusing an id are dropped.
    pub fn new(clients: Vec<TransportClient>, consent: ConsentGate, audit: AuditLog) -> Self {
        let mut adapter = Self {
            clients: Vec::with_capacity(clients.len()),
            by_backend: HashMap::new(),
            registry: RwLock::new(Arc::new(ToolRegistry::new())),
            enabled_tools: None,
            consent,
            audit,
            config_failures: Vec::new(),
        };
        for client in clients {
            adapter.add_client(client);
        }
        adapter
    }

    /// Build clients, consent gate and audit log from configuration.
    ///
    /// A bad descriptor disables only its own backend; the failure is kept in
    /// [`config_failures`](Self::config_failures).
    pub fn from_config(config: &OrchestratorConfig, db: SharedDatabase) -> Self {
        let factory = ClientFactory::new(config.transport_settings(), db.clone());
        let mut clients = Vec::new();
        let mut failures = Vec::new();

        for descriptor in config.active_backends() {
            match factory.build(descriptor) {
                Ok(client) => clients.push(client),
                Err(e) => {
                    tracing::error!(backend = %descriptor.id, error = %e, "backend disabled by configuration error");
                    failures.push(BackendFailure {
                        backend_id: descriptor.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let mut adapter = Self::new(
            clients,
            ConsentGate::new(db.clone(), config.allow_all_consent),
            AuditLog::new(db),
        );
        adapter.config_failures.extend(failures);
        if let Some(tools) = &config.enabled_tools {
            adapter = adapter.with_enabled_tools(tools.iter().cloned().collect());
        }
        adapter
    }

    /// Restrict discovery results to these public names.
    pub fn with_enabled_tools(mut self, tools: HashSet<String>) -> Self {
        self.enabled_tools = Some(tools);
        self
    }

    fn add_client(&mut self, client: TransportClient) {
        let backend_id = client.backend_id().to_string();
        if self.by_backend.contains_key(&backend_id) {
            tracing::error!(backend = %backend_id, "duplicate backend id, ignoring later descriptor");
            self.config_failures.push(BackendFailure {
                backend_id,
                error: "duplicate backend id".into(),
            });
            return;
        }
        let client = Arc::new(client);
        self.by_backend.insert(backend_id, client.clone());
        self.clients.push(client);
    }

    pub fn consent(&self) -> &ConsentGate {
        &self.consent
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Backends that were never built because their descriptor was invalid.
    pub fn config_failures(&self) -> &[BackendFailure] {
        &self.config_failures
    }

    pub fn client(&self, backend_id: &str) -> Option<Arc<TransportClient>> {
        self.by_backend.get(backend_id).cloned()
    }

    // ─── Discovery ──────────────────────────────────────────────────────

    /// Run a discovery pass and swap the new registry in.
    pub async fn refresh_tools(&self) -> DiscoveryReport {
        let mut report = discover(&self.clients).await;
        if let Some(allowed) = &self.enabled_tools {
            report.registry.retain_tools(allowed);
        }

        let fresh = Arc::new(report.registry.clone());
        *self.registry.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        report
    }

    /// Snapshot of the current registry.
    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cached function-calling schemas for every discovered tool.
    pub fn get_tool_schemas(&self) -> Vec<serde_json::Value> {
        self.registry().to_openai_tools()
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Dispatch a batch of calls concurrently. Outputs keep input order.
    pub async fn dispatch_tool_calls(
        &self,
        calls: &[ToolCallRequest],
        user_id: Option<&str>,
    ) -> Vec<ToolOutput> {
        join_all(calls.iter().map(|call| async move {
            let result = self
                .dispatch(&call.name, &call.arguments, user_id, &call.call_id)
                .await;
            ToolOutput {
                call_id: call.call_id.clone(),
                output: result.to_string(),
            }
        }))
        .await
    }

    /// Dispatch one call. Always returns a payload, never an error.
    pub async fn dispatch(
        &self,
        public_name: &str,
        raw_args: &str,
        user_id: Option<&str>,
        call_id: &str,
    ) -> serde_json::Value {
        match self.try_dispatch(public_name, raw_args, user_id, call_id).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    tool = public_name,
                    call_id,
                    kind = e.kind(),
                    error = %e,
                    "tool call failed"
                );
                e.to_payload()
            }
        }
    }

    async fn try_dispatch(
        &self,
        public_name: &str,
        raw_args: &str,
        user_id: Option<&str>,
        call_id: &str,
    ) -> Result<serde_json::Value, DispatchError> {
        let arguments = parse_arguments(public_name, raw_args)?;

        let registry = self.registry();
        let tool = registry
            .resolve(public_name)
            .ok_or_else(|| DispatchError::ToolNotFound {
                name: public_name.to_string(),
            })?;
        registry
            .validate_arguments(public_name, &arguments)
            .map_err(|reason| DispatchError::BadArguments {
                tool: public_name.to_string(),
                reason,
            })?;
        let client = self
            .by_backend
            .get(&tool.backend_id)
            .ok_or_else(|| DispatchError::ToolNotFound {
                name: public_name.to_string(),
            })?;

        let ctx = ExecutionContext {
            call_id,
            backend_id: &tool.backend_id,
            tool_name: &tool.original_name,
            user_id,
            arguments: &arguments,
        };

        if !self
            .consent
            .authorize(user_id, &tool.backend_id, &tool.original_name)
        {
            let denied = DispatchError::ConsentDenied {
                backend: tool.backend_id.clone(),
                tool: tool.original_name.clone(),
            };
            self.audit.record_denied(ctx, &denied.to_string());
            return Err(denied);
        }

        let pending = self.audit.begin(ctx);
        tracing::info!(
            backend = %tool.backend_id,
            tool = %tool.original_name,
            call_id,
            "dispatching tool call"
        );

        let outcome = call_backend(client, &tool.original_name, arguments.clone()).await;
        if let Some(pending) = &pending {
            match &outcome {
                Ok(result) => self.audit.complete_success(pending, result),
                Err(e) => self.audit.complete_error(pending, &e.to_string()),
            }
        }
        Ok(outcome?)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    pub fn backend_status(&self) -> Vec<BackendStatus> {
        let registry = self.registry();
        self.clients
            .iter()
            .map(|client| BackendStatus {
                backend_id: client.backend_id().to_string(),
                kind: client.kind(),
                state: client.state(),
                tools: registry.tools_for_backend(client.backend_id()),
            })
            .collect()
    }

    /// Disconnect every backend.
    pub async fn shutdown(&self) {
        join_all(self.clients.iter().map(|client| client.disconnect())).await;
        tracing::info!(backends = self.clients.len(), "all backends disconnected");
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Parse the model's argument string. Blank means no arguments.
fn parse_arguments(public_name: &str, raw_args: &str) -> Result<serde_json::Value, DispatchError> {
    if raw_args.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(raw_args).map_err(|e| DispatchError::BadArguments {
        tool: public_name.to_string(),
        reason: e.to_string(),
    })
}

/// Call a tool, making one connection attempt first if needed.
async fn call_backend(
    client: &TransportClient,
    tool_name: &str,
    arguments: serde_json::Value,
) -> Result<serde_json::Value, TransportError> {
    if !client.is_connected() {
        tracing::info!(
            backend = client.backend_id(),
            state = client.state().as_str(),
            "backend not connected, reconnecting before dispatch"
        );
        client.connect().await?;
    }
    client.call_tool(tool_name, arguments).await
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::{BridgeDatabase, ExecutionStatus};
    use crate::transport::{build_client, BackendDescriptor, ConnectionState, TransportSettings};

    fn settings() -> TransportSettings {
        TransportSettings {
            simulated_latency: Duration::ZERO,
            ..TransportSettings::default()
        }
    }

    fn adapter_with(descriptors: &[BackendDescriptor], allow_all: bool) -> OrchestrationAdapter {
        let db = BridgeDatabase::open_shared(":memory:").unwrap();
        let clients = descriptors
            .iter()
            .map(|d| build_client(d, &settings(), &db).unwrap())
            .collect();
        OrchestrationAdapter::new(
            clients,
            ConsentGate::new(db.clone(), allow_all),
            AuditLog::new(db),
        )
    }

    fn sim(id: &str) -> BackendDescriptor {
        BackendDescriptor::new(id, "simulated")
    }

    #[tokio::test]
    async fn test_unknown_tool_leaves_no_pending_record() {
        let adapter = adapter_with(&[sim("sim")], true);
        adapter.refresh_tools().await;

        let result = adapter
            .dispatch("does_not_exist", "{}", Some("alice"), "call_x")
            .await;
        assert!(result["error"].as_str().unwrap().contains("not found"));
        assert!(adapter.audit().for_call("call_x").unwrap().is_empty());
        assert!(adapter
            .audit()
            .by_status(ExecutionStatus::Pending)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_reported() {
        let adapter = adapter_with(&[sim("sim")], true);
        adapter.refresh_tools().await;

        let result = adapter
            .dispatch("sim_calculator", "{not json", None, "call_1")
            .await;
        assert!(result["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid arguments for tool 'sim_calculator'"));

        let missing = adapter.dispatch("sim_calculator", "{}", None, "call_2").await;
        assert!(missing["error"].as_str().unwrap().contains("expression"));
        assert!(adapter.audit().for_call("call_1").unwrap().is_empty());
        assert!(adapter.audit().for_call("call_2").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_consent_denied_is_audited() {
        let adapter = adapter_with(&[sim("sim")], false);
        adapter.refresh_tools().await;

        let result = adapter
            .dispatch("sim_calculator", r#"{"expression":"1+1"}"#, Some("bob"), "call_d")
            .await;
        assert_eq!(
            result["error"],
            "consent denied for tool 'calculator' on backend 'sim'"
        );

        let records = adapter.audit().for_call("call_d").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Error);
        assert_eq!(records[0].tool_name, "calculator");
    }

    #[tokio::test]
    async fn test_granted_call_succeeds() {
        let adapter = adapter_with(&[sim("sim")], false);
        adapter.refresh_tools().await;
        adapter
            .consent()
            .grant(Some("alice"), "sim", "calculator")
            .unwrap();

        let result = adapter
            .dispatch("sim_calculator", r#"{"expression":"(2+3)*4"}"#, Some("alice"), "call_ok")
            .await;
        assert_eq!(result["result"], 20);

        let records = adapter.audit().for_call("call_ok").unwrap();
        assert_eq!(records[0].status, ExecutionStatus::Success);
        assert_eq!(records[0].result.as_ref().unwrap()["result"], 20);
    }

    #[tokio::test]
    async fn test_backend_failure_completes_record_as_error() {
        let adapter = adapter_with(&[sim("sim")], true);
        adapter.refresh_tools().await;

        let result = adapter
            .dispatch("sim_calculator", r#"{"expression":"1/0"}"#, None, "call_e")
            .await;
        assert!(result["error"].as_str().unwrap().contains("division by zero"));

        let record = &adapter.audit().for_call("call_e").unwrap()[0];
        assert_eq!(record.status, ExecutionStatus::Error);
        assert!(record.error.as_deref().unwrap().contains("division by zero"));
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_record_is_pending_while_call_runs() {
        let mut slow = sim("slow");
        slow.latency_ms = Some(300);
        let adapter = Arc::new(adapter_with(&[slow], true));
        adapter.refresh_tools().await;

        let task = {
            let adapter = adapter.clone();
            tokio::spawn(async move {
                adapter
                    .dispatch("slow_web_search", r#"{"query":"rust"}"#, None, "call_p")
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let pending = adapter.audit().by_status(ExecutionStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].call_id, "call_p");

        let result = task.await.unwrap();
        assert!(result.get("error").is_none());
        assert_eq!(
            adapter.audit().for_call("call_p").unwrap()[0].status,
            ExecutionStatus::Success
        );
    }

    #[tokio::test]
    async fn test_schemas_served_from_cache() {
        let adapter = adapter_with(&[sim("sim")], true);
        assert!(adapter.get_tool_schemas().is_empty());

        adapter.refresh_tools().await;
        adapter.shutdown().await;

        let schemas = adapter.get_tool_schemas();
        assert_eq!(schemas.len(), 4);
        assert_eq!(schemas[0]["type"], "function");
        assert_eq!(schemas[0]["function"]["name"], "sim_calculator");
    }

    #[tokio::test]
    async fn test_enabled_tools_filter() {
        let adapter = adapter_with(&[sim("sim")], true)
            .with_enabled_tools(["sim_web_search".to_string()].into_iter().collect());
        let report = adapter.refresh_tools().await;

        assert_eq!(report.registry.len(), 1);
        let result = adapter
            .dispatch("sim_calculator", r#"{"expression":"1"}"#, None, "call_f")
            .await;
        assert!(result["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_batch_keeps_order() {
        let adapter = adapter_with(&[sim("sim")], true);
        adapter.refresh_tools().await;

        let calls = vec![
            ToolCallRequest {
                call_id: "a".into(),
                name: "sim_web_search".into(),
                arguments: r#"{"query":"tokio"}"#.into(),
            },
            ToolCallRequest {
                call_id: "b".into(),
                name: "does_not_exist".into(),
                arguments: "{}".into(),
            },
            ToolCallRequest {
                call_id: "c".into(),
                name: "sim_calculator".into(),
                arguments: r#"{"expression":"6*7"}"#.into(),
            },
        ];
        let outputs = adapter.dispatch_tool_calls(&calls, None).await;

        let ids: Vec<_> = outputs.iter().map(|o| o.call_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        let second: serde_json::Value = serde_json::from_str(&outputs[1].output).unwrap();
        assert!(second.get("error").is_some());
        let third: serde_json::Value = serde_json::from_str(&outputs[2].output).unwrap();
        assert_eq!(third["result"], 42);
    }

    #[tokio::test]
    async fn test_reconnects_once_before_dispatch() {
        let adapter = adapter_with(&[sim("sim")], true);
        adapter.refresh_tools().await;
        adapter.client("sim").unwrap().disconnect().await;

        let result = adapter
            .dispatch("sim_calculator", r#"{"expression":"2+2"}"#, None, "call_r")
            .await;
        assert_eq!(result["result"], 4);
        assert_eq!(
            adapter.client("sim").unwrap().state(),
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_backend_status_and_duplicates() {
        let adapter = adapter_with(&[sim("sim"), sim("sim")], true);
        assert_eq!(adapter.config_failures().len(), 1);
        adapter.refresh_tools().await;

        let status = adapter.backend_status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, ConnectionState::Connected);
        assert_eq!(status[0].tools, 4);

        adapter.shutdown().await;
        assert_eq!(adapter.backend_status()[0].state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_from_config_isolates_bad_descriptor() {
        let config = OrchestratorConfig {
            backends: vec![BackendDescriptor::new("ws", "websocket"), sim("sim")],
            allow_all_consent: true,
            simulated_latency_ms: 0,
            ..OrchestratorConfig::default()
        };
        let db = BridgeDatabase::open_shared(":memory:").unwrap();
        let adapter = OrchestrationAdapter::from_config(&config, db);

        assert_eq!(adapter.config_failures().len(), 1);
        assert_eq!(adapter.config_failures()[0].backend_id, "ws");
        let report = adapter.refresh_tools().await;
        assert_eq!(report.registry.len(), 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_backend_end_to_end() {
        let adapter = adapter_with(&[crate::test_support::pipe_fixture_descriptor("srv1")], false);
        let report = adapter.refresh_tools().await;
        assert!(report.failures.is_empty());
        adapter
            .consent()
            .grant(Some("alice"), "srv1", "calculator")
            .unwrap();

        let result = adapter
            .dispatch("srv1_calculator", r#"{"expression":"2+2"}"#, Some("alice"), "call_1")
            .await;
        assert_eq!(result["content"][0]["text"], "4");

        let records = adapter.audit().for_call("call_1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Success);
        assert_eq!(records[0].backend_id, "srv1");
        adapter.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_disconnect_fails_outstanding_dispatches() {
        let adapter = Arc::new(adapter_with(
            &[crate::test_support::pipe_fixture_descriptor("srv1")],
            true,
        ));
        adapter.refresh_tools().await;

        let spawn_hang = |call_id: &'static str| {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.dispatch("srv1_hang", "", None, call_id).await })
        };
        let first = spawn_hang("h1");
        let second = spawn_hang("h2");
        tokio::time::sleep(Duration::from_millis(100)).await;

        adapter.client("srv1").unwrap().disconnect().await;
        for task in [first, second] {
            let result = tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .unwrap()
                .unwrap();
            assert!(result["error"].as_str().unwrap().contains("disconnected"));
        }
        assert!(adapter
            .audit()
            .by_status(ExecutionStatus::Pending)
            .unwrap()
            .is_empty());
    }
}
