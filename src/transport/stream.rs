//! Stream transport: a long-lived SSE channel for responses plus one HTTP
//! POST per request.
//!
//! Requests carry their correlation id both in the JSON body and in an
//! `X-Request-Id` header. Responses arrive as `message` events whose data is
//! `{ id, data?, error? }`. An `endpoint` event may redirect where requests
//! are POSTed; until one arrives they go to the stream URL itself.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use reqwest::{Client as HttpClient, Url};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::TransportError;
use super::pending::{CallOutcome, LinkState, PendingCalls};
use super::sse::{parse_event_stream, SseEvent};
use super::types::{
    tools_from_payload, ConnectionState, TransportSettings, WireRequest, WireResponse,
};

/// Header carrying the correlation id on every POST.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

// ─── StreamClient ────────────────────────────────────────────────────────────

/// Transport client for an HTTP/SSE backend.
pub struct StreamClient {
    backend_id: String,
    stream_url: Url,
    api_key: Option<String>,
    settings: TransportSettings,
    /// POST client, bounded by the call timeout.
    http: HttpClient,
    /// Event-stream client; only the connect phase is bounded.
    http_stream: HttpClient,
    link: Arc<LinkState>,
    connection: Mutex<Option<StreamConnection>>,
}

struct StreamConnection {
    pending: Arc<PendingCalls>,
    post_url: Arc<std::sync::Mutex<Url>>,
    reader: JoinHandle<()>,
}

impl StreamConnection {
    fn close(self) {
        self.reader.abort();
        self.pending.fail_all();
    }
}

impl StreamClient {
    pub fn new(
        backend_id: &str,
        stream_url: Url,
        api_key: Option<String>,
        settings: TransportSettings,
    ) -> Result<Self, TransportError> {
        let http = HttpClient::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.call_timeout)
            .build()
            .map_err(|e| TransportError::Configuration {
                backend: backend_id.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let http_stream = HttpClient::builder()
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| TransportError::Configuration {
                backend: backend_id.to_string(),
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            backend_id: backend_id.to_string(),
            stream_url,
            api_key,
            settings,
            http,
            http_stream,
            link: Arc::new(LinkState::new()),
            connection: Mutex::new(None),
        })
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn state(&self) -> ConnectionState {
        self.link.current()
    }

    /// Where requests are currently POSTed, if connected.
    pub async fn post_url(&self) -> Option<String> {
        let guard = self.connection.lock().await;
        guard.as_ref().map(|c| {
            c.post_url
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .to_string()
        })
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Open the event stream. Bounded by the connect timeout.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut guard = self.connection.lock().await;
        if self.link.is_connected() && guard.is_some() {
            return Ok(());
        }
        if let Some(stale) = guard.take() {
            stale.close();
        }

        let generation = self.link.begin_connect();

        let mut request = self
            .http_stream
            .get(self.stream_url.clone())
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response =
            match tokio::time::timeout(self.settings.connect_timeout, request.send()).await {
                Ok(Ok(resp)) if resp.status().is_success() => resp,
                Ok(Ok(resp)) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(self.connect_failed(
                        generation,
                        format!("event stream returned HTTP {status}: {}", body.trim()),
                    ));
                }
                Ok(Err(e)) => {
                    return Err(self.connect_failed(generation, e.to_string()));
                }
                Err(_) => {
                    return Err(self.connect_failed(
                        generation,
                        format!(
                            "event stream not established within {}ms",
                            self.settings.connect_timeout.as_millis()
                        ),
                    ));
                }
            };

        let pending = Arc::new(PendingCalls::new(&self.backend_id));
        let post_url = Arc::new(std::sync::Mutex::new(self.stream_url.clone()));
        let reader = tokio::spawn(read_events(
            self.backend_id.clone(),
            self.stream_url.clone(),
            parse_event_stream(response.bytes_stream()),
            Arc::clone(&pending),
            Arc::clone(&post_url),
            Arc::clone(&self.link),
            generation,
        ));

        self.link.set(generation, ConnectionState::Connected);
        *guard = Some(StreamConnection {
            pending,
            post_url,
            reader,
        });
        tracing::info!(backend = %self.backend_id, url = %self.stream_url, "stream backend connected");
        Ok(())
    }

    fn connect_failed(&self, generation: u64, reason: String) -> TransportError {
        self.link.set(generation, ConnectionState::Error);
        tracing::warn!(backend = %self.backend_id, reason = %reason, "stream connect failed");
        TransportError::Connection {
            backend: self.backend_id.clone(),
            reason,
        }
    }

    /// Close the event stream and reject every outstanding call.
    pub async fn disconnect(&self) {
        let mut guard = self.connection.lock().await;
        self.link.reset();
        if let Some(connection) = guard.take() {
            connection.close();
            tracing::info!(backend = %self.backend_id, "stream backend disconnected");
        }
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    async fn channel(&self) -> Result<(Arc<PendingCalls>, Url), TransportError> {
        let guard = self.connection.lock().await;
        match guard.as_ref() {
            Some(c) if self.link.is_connected() => {
                let url = c.post_url.lock().unwrap_or_else(|e| e.into_inner()).clone();
                Ok((Arc::clone(&c.pending), url))
            }
            _ => Err(TransportError::NotConnected {
                backend: self.backend_id.clone(),
            }),
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<serde_json::Value>, TransportError> {
        let payload = self.request(WireRequest::list_tools(), "list_tools").await?;
        tools_from_payload(&self.backend_id, payload)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        self.request(WireRequest::call_tool(name, arguments), name)
            .await
    }

    /// POST one request; the answer comes back over the event stream.
    ///
    /// The POST runs detached so a slow HTTP acknowledgement can't outlive
    /// the call's own deadline. A failed POST rejects the pending entry.
    async fn request(&self, request: WireRequest, label: &str) -> CallOutcome {
        let (pending, post_url) = self.channel().await?;
        let slot = pending.register(&request.id, label)?;

        let mut http_request = self
            .http
            .post(post_url.clone())
            .header(REQUEST_ID_HEADER, request.id.as_str())
            .json(&request);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let backend = self.backend_id.clone();
        let id = request.id.clone();
        let post_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            let failure = match http_request.send().await {
                Ok(resp) if resp.status().is_success() => None,
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    Some(format!("request POST returned HTTP {status}: {}", body.trim()))
                }
                Err(e) => Some(format!("request POST failed: {e}")),
            };
            if let Some(reason) = failure {
                tracing::warn!(backend = %backend, correlation_id = %id, reason = %reason, "stream request failed");
                post_pending.reject(&id, TransportError::Protocol { backend, reason });
            }
        });

        tracing::debug!(
            backend = %self.backend_id,
            correlation_id = %slot.id(),
            url = %post_url,
            action = label,
            "posted stream request"
        );
        slot.wait(self.settings.call_timeout).await
    }
}

// ─── Event Reader ────────────────────────────────────────────────────────────

/// Dispatch events until the channel drops, then apply disconnect semantics.
async fn read_events<S>(
    backend: String,
    stream_url: Url,
    events: S,
    pending: Arc<PendingCalls>,
    post_url: Arc<std::sync::Mutex<Url>>,
    link: Arc<LinkState>,
    generation: u64,
) where
    S: Stream<Item = Result<SseEvent, String>>,
{
    let mut events = Box::pin(events);
    let reason = loop {
        match events.next().await {
            Some(Ok(event)) => handle_event(&backend, &stream_url, &pending, &post_url, event),
            Some(Err(e)) => break e,
            None => break "event stream closed".to_string(),
        }
    };

    if link.set(generation, ConnectionState::Disconnected) {
        tracing::warn!(backend = %backend, reason = %reason, "stream backend disconnected");
    }
    pending.fail_all();
}

fn handle_event(
    backend: &str,
    stream_url: &Url,
    pending: &PendingCalls,
    post_url: &std::sync::Mutex<Url>,
    event: SseEvent,
) {
    if event.event == "endpoint" {
        match stream_url.join(event.data.trim()) {
            Ok(url) if url.origin() != stream_url.origin() => {
                tracing::warn!(
                    backend,
                    url = %url,
                    "ignoring endpoint event pointing at a different origin"
                );
            }
            Ok(url) => {
                tracing::info!(backend, url = %url, "stream backend announced request endpoint");
                *post_url.lock().unwrap_or_else(|e| e.into_inner()) = url;
            }
            Err(e) => {
                tracing::warn!(backend, data = %event.data, error = %e, "ignoring invalid endpoint event");
            }
        }
        return;
    }

    let data = event.data.trim();
    let responses = if data.starts_with('[') {
        serde_json::from_str::<Vec<WireResponse>>(data)
    } else {
        serde_json::from_str::<WireResponse>(data).map(|r| vec![r])
    };

    match responses {
        Ok(responses) => {
            for response in responses {
                let id = response.id.clone();
                if !pending.resolve(response) {
                    tracing::warn!(
                        backend,
                        correlation_id = %id,
                        "dropping event with no matching pending call"
                    );
                }
            }
        }
        Err(e) => {
            tracing::debug!(backend, event = %event.event, error = %e, "event is not a protocol response");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
