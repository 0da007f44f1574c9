//! Client factory: backend descriptor in, transport client out.

use std::time::Duration;

use reqwest::Url;

use super::client::TransportClient;
use super::errors::TransportError;
use super::lifecycle::ProcessSpec;
use super::pipe::PipeClient;
use super::simulated::SimulatedClient;
use super::stream::StreamClient;
use super::types::{BackendDescriptor, TransportKind, TransportSettings};
use crate::storage::SharedDatabase;

/// Builds transport clients with shared settings and store.
#[derive(Clone)]
pub struct ClientFactory {
    settings: TransportSettings,
    db: SharedDatabase,
}

impl ClientFactory {
    pub fn new(settings: TransportSettings, db: SharedDatabase) -> Self {
        Self { settings, db }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Construct the client for one descriptor. Nothing is spawned or
    /// connected here.
    pub fn build(&self, descriptor: &BackendDescriptor) -> Result<TransportClient, TransportError> {
        build_client(descriptor, &self.settings, &self.db)
    }
}

fn config_error(descriptor: &BackendDescriptor, reason: impl Into<String>) -> TransportError {
    TransportError::Configuration {
        backend: descriptor.id.clone(),
        reason: reason.into(),
    }
}

/// Select and construct the client variant for `descriptor`.
///
/// Fails with `Configuration` on an unknown kind or missing connection
/// parameters.
pub fn build_client(
    descriptor: &BackendDescriptor,
    settings: &TransportSettings,
    db: &SharedDatabase,
) -> Result<TransportClient, TransportError> {
    if descriptor.id.trim().is_empty() {
        return Err(config_error(descriptor, "backend id must not be empty"));
    }

    let kind = TransportKind::parse(&descriptor.transport_kind).ok_or_else(|| {
        config_error(
            descriptor,
            format!(
                "unsupported transport kind '{}' (expected pipe, stream or simulated)",
                descriptor.transport_kind
            ),
        )
    })?;

    let client = match kind {
        TransportKind::Pipe => {
            let command = descriptor
                .command
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .ok_or_else(|| config_error(descriptor, "pipe backend requires a command"))?;
            let spec = ProcessSpec {
                command: command.to_string(),
                args: descriptor.args.clone(),
                env: descriptor.env.clone(),
                cwd: descriptor.cwd.clone(),
            };
            TransportClient::Pipe(PipeClient::new(&descriptor.id, spec, *settings))
        }
        TransportKind::Stream => {
            let raw = descriptor
                .url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .ok_or_else(|| config_error(descriptor, "stream backend requires a url"))?;
            let url = Url::parse(raw)
                .map_err(|e| config_error(descriptor, format!("invalid url '{raw}': {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(config_error(
                    descriptor,
                    format!("unsupported url scheme '{}'", url.scheme()),
                ));
            }
            TransportClient::Stream(StreamClient::new(
                &descriptor.id,
                url,
                descriptor.api_key.clone(),
                *settings,
            )?)
        }
        TransportKind::Simulated => {
            let latency = descriptor
                .latency_ms
                .map(Duration::from_millis)
                .unwrap_or(settings.simulated_latency);
            TransportClient::Simulated(SimulatedClient::new(&descriptor.id, db.clone(), latency))
        }
    };

    tracing::debug!(
        backend = %descriptor.id,
        kind = kind.as_str(),
        "built transport client"
    );
    Ok(client)
}
