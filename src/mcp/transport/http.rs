//! Streamable HTTP transport for MCP
//!
//! Every outbound JSON-RPC message is sent as an HTTP POST to a single
//! endpoint. The server may reply with:
//!
//! - `application/json` -- a direct JSON response body
//! - `text/event-stream` -- an SSE stream carrying one or more JSON-RPC
//!   messages
//! - `202 Accepted` -- an acknowledgement with no body (used for
//!   notifications)
//!
//! # Session management
//!
//! After a successful `initialize` POST the server MAY return an
//! `MCP-Session-Id` response header. When present, it is attached to every
//! subsequent POST. A `404` while a session is active clears the session and
//! fails the send with `"mcp session expired"`.
//!
//! # Drop behaviour
//!
//! When the transport is dropped with an active session, a best-effort HTTP
//! DELETE carrying the `MCP-Session-Id` header terminates it.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{AggregatorError, Result};
use crate::mcp::transport::sse::pump_sse_events;
use crate::mcp::transport::Transport;
use crate::mcp::types::LATEST_PROTOCOL_VERSION;

/// Streamable HTTP MCP transport.
///
/// # Examples
///
/// ```no_run
/// use std::collections::HashMap;
/// use std::time::Duration;
/// use url::Url;
/// use toolmesh::mcp::transport::http::HttpTransport;
///
/// # fn main() -> anyhow::Result<()> {
/// let transport = HttpTransport::new(
///     Url::parse("http://localhost:3000/mcp")?,
///     HashMap::new(),
///     Duration::from_secs(30),
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    endpoint: url::Url,
    session_id: Arc<RwLock<Option<String>>>,
    /// Extra headers merged into every request (e.g. Authorization).
    headers: HashMap<String, String>,
    response_tx: mpsc::UnboundedSender<String>,
    response_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    error_tx: mpsc::UnboundedSender<String>,
    error_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    /// Last SSE event ID, replayed as `Last-Event-ID` for resumption.
    last_event_id: Arc<StdRwLock<Option<String>>>,
    streams: CancellationToken,
}

impl HttpTransport {
    /// Construct a transport targeting `endpoint`. No network I/O happens
    /// here; `timeout` bounds each individual HTTP request.
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorError::McpTransport`] if the HTTP client cannot be
    /// built (for example when TLS initialisation fails).
    pub fn new(
        endpoint: url::Url,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AggregatorError::McpTransport(format!("HTTP client setup failed: {e}")))?;

        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        Ok(Self {
            http_client,
            endpoint,
            session_id: Arc::new(RwLock::new(None)),
            headers,
            response_tx,
            response_rx: Arc::new(Mutex::new(response_rx)),
            error_tx,
            error_rx: Arc::new(Mutex::new(error_rx)),
            last_event_id: Arc::new(StdRwLock::new(None)),
            streams: CancellationToken::new(),
        })
    }

    /// The active `MCP-Session-Id`, if the server assigned one.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    fn last_event_id(&self) -> Option<String> {
        self.last_event_id.read().ok().and_then(|id| id.clone())
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: String) -> Result<()> {
        let mut req = self
            .http_client
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", LATEST_PROTOCOL_VERSION)
            .body(message);

        if let Some(id) = self.session_id.read().await.as_deref() {
            req = req.header("MCP-Session-Id", id);
        }
        if let Some(id) = self.last_event_id() {
            req = req.header("Last-Event-ID", id);
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = req
            .send()
            .await
            .map_err(|e| AggregatorError::McpTransport(format!("HTTP POST failed: {e}")))?;

        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get("WWW-Authenticate")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let _ = self.error_tx.send(format!("unauthorized: {challenge}"));
            let message = format!("HTTP 401 Unauthorized {challenge}");
            return Err(AggregatorError::McpTransport(message.trim_end().to_string()).into());
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            let mut sid = self.session_id.write().await;
            if sid.take().is_some() {
                return Err(AggregatorError::Mcp("mcp session expired".into()).into());
            }
            return Err(AggregatorError::McpTransport("HTTP 404 Not Found".into()).into());
        }

        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        if !status.is_success() {
            return Err(AggregatorError::McpTransport(format!(
                "HTTP POST returned status {status}"
            ))
            .into());
        }

        if let Some(new_session_id) = response
            .headers()
            .get("MCP-Session-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        {
            let mut sid = self.session_id.write().await;
            if sid.is_none() {
                *sid = Some(new_session_id);
            }
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            let byte_stream = response.bytes_stream();
            let response_tx = self.response_tx.clone();
            let last_event_id = Arc::clone(&self.last_event_id);
            let token = self.streams.child_token();
            tokio::spawn(async move {
                pump_sse_events(byte_stream, token, |event| {
                    if let Some(id) = &event.id {
                        if let Ok(mut last) = last_event_id.write() {
                            *last = Some(id.clone());
                        }
                    }
                    if event.is_message() {
                        let _ = response_tx.send(event.data);
                    }
                })
                .await;
            });
            return Ok(());
        }

        let body = response
            .text()
            .await
            .map_err(|e| AggregatorError::McpTransport(format!("failed to read body: {e}")))?;
        if !body.trim().is_empty() {
            let _ = self.response_tx.send(body);
        }
        Ok(())
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.response_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let item = rx.lock().await.recv().await?;
            Some((item, rx))
        }))
    }

    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.error_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let item = rx.lock().await.recv().await?;
            Some((item, rx))
        }))
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.streams.cancel();

        let session_id = match self.session_id.try_read() {
            Ok(sid) => sid.clone(),
            Err(_) => None,
        };
        let Some(sid) = session_id else {
            return;
        };

        // The blocking client must not run on a runtime worker thread.
        let endpoint = self.endpoint.to_string();
        let headers = self.headers.clone();
        std::thread::spawn(move || {
            let Ok(client) = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
            else {
                return;
            };
            let mut req = client
                .delete(&endpoint)
                .header("MCP-Session-Id", sid.as_str())
                .header("MCP-Protocol-Version", LATEST_PROTOCOL_VERSION);
            for (k, v) in &headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Err(e) = req.send() {
                tracing::debug!("MCP session DELETE failed: {e}");
            }
        });
    }
}
