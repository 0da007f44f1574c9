//! Discovery pass: connect every backend, list its tools and build a fresh
//! registry.
//!
//! Backends are contacted concurrently but registered in configuration
//! order, so collision resolution ("first registered wins") is stable.

use std::sync::Arc;

use futures::future::join_all;

use super::client::TransportClient;
use super::errors::TransportError;
use super::registry::{SkippedTool, ToolRegistry};

/// A backend that contributed no tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFailure {
    pub backend_id: String,
    pub error: String,
}

/// Outcome of one discovery pass.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub registry: ToolRegistry,
    pub failures: Vec<BackendFailure>,
    pub skipped: Vec<SkippedTool>,
}

async fn connect_and_list(
    client: &TransportClient,
) -> Result<Vec<serde_json::Value>, TransportError> {
    client.connect().await?;
    client.list_tools().await
}

/// Build a registry from `clients`, isolating per-backend failures.
pub async fn discover(clients: &[Arc<TransportClient>]) -> DiscoveryReport {
    let listings = join_all(clients.iter().map(|client| async move {
        (client.backend_id().to_string(), connect_and_list(client).await)
    }))
    .await;

    let mut report = DiscoveryReport::default();
    for (backend_id, listing) in listings {
        match listing {
            Ok(raw_tools) => {
                let skipped = report.registry.register_raw_tools(&backend_id, &raw_tools);
                tracing::info!(
                    backend = %backend_id,
                    listed = raw_tools.len(),
                    registered = report.registry.tools_for_backend(&backend_id),
                    skipped = skipped.len(),
                    "discovered backend tools"
                );
                report.skipped.extend(skipped);
            }
            Err(e) => {
                tracing::warn!(backend = %backend_id, error = %e, "backend discovery failed");
                report.failures.push(BackendFailure {
                    backend_id,
                    error: e.to_string(),
                });
            }
        }
    }

    tracing::info!(
        tools = report.registry.len(),
        backends = clients.len(),
        failed = report.failures.len(),
        skipped = report.skipped.len(),
        "tool discovery complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BridgeDatabase;
    use crate::transport::factory::ClientFactory;
    use crate::transport::types::{BackendDescriptor, TransportSettings};

    fn factory() -> ClientFactory {
        let settings = TransportSettings {
            simulated_latency: std::time::Duration::ZERO,
            ..TransportSettings::default()
        };
        ClientFactory::new(settings, BridgeDatabase::open_shared(":memory:").unwrap())
    }

    #[tokio::test]
    async fn test_failed_backend_does_not_block_others() {
        let f = factory();
        let mut broken = BackendDescriptor::new("broken", "pipe");
        broken.command = Some("/nonexistent/toolbridge-backend".into());

        let clients = vec![
            Arc::new(f.build(&broken).unwrap()),
            Arc::new(f.build(&BackendDescriptor::new("sim", "simulated")).unwrap()),
        ];
        let report = discover(&clients).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].backend_id, "broken");
        assert_eq!(report.registry.tools_for_backend("sim"), 4);
        assert!(report.registry.resolve("sim_calculator").is_some());
    }

    #[tokio::test]
    async fn test_collisions_resolve_in_config_order() {
        let f = factory();
        let clients = vec![
            Arc::new(f.build(&BackendDescriptor::new("sim.a", "simulated")).unwrap()),
            Arc::new(f.build(&BackendDescriptor::new("sim_a", "simulated")).unwrap()),
        ];
        let report = discover(&clients).await;

        assert_eq!(report.registry.len(), 4);
        assert_eq!(report.skipped.len(), 4);
        assert!(report.skipped.iter().all(|s| s.backend_id == "sim_a"));
        assert_eq!(
            report.registry.resolve("sim_a_calculator").unwrap().backend_id,
            "sim.a"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_discovers_pipe_backend() {
        let f = factory();
        let clients = vec![Arc::new(
            f.build(&crate::test_support::pipe_fixture_descriptor("srv1"))
                .unwrap(),
        )];
        let report = discover(&clients).await;
        assert!(report.failures.is_empty());
        assert!(report.registry.resolve("srv1_calculator").is_some());
        clients[0].disconnect().await;
    }
}
