//! Server-Sent Events decoding and the legacy HTTP+SSE transport
//!
//! [`SseDecoder`] turns a chunked `text/event-stream` body into
//! [`SseEvent`]s. It is shared by both HTTP based transports.
//!
//! [`SseTransport`] speaks the original MCP HTTP+SSE binding:
//!
//! 1. `GET <url>` with `Accept: text/event-stream` opens a long-lived stream.
//! 2. The server's first event is `event: endpoint` whose data is the URL
//!    (usually relative) that accepts client messages.
//! 3. Every client message is POSTed to that endpoint; replies and server
//!    notifications arrive on the GET stream as `event: message`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{AggregatorError, Result};
use crate::mcp::transport::Transport;

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    /// Value of the `id:` field, if any.
    pub id: Option<String>,
}

impl SseEvent {
    /// Whether this is a keep-alive the MCP peers exchange and ignore.
    pub fn is_ping(&self) -> bool {
        self.event
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case("ping"))
            || self.data.eq_ignore_ascii_case("[ping]")
    }

    /// Whether this event carries a JSON-RPC message.
    pub fn is_message(&self) -> bool {
        !self.is_ping()
            && !self.data.is_empty()
            && matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes are buffered until a blank line closes an event, so multi-byte
/// UTF-8 sequences split across chunks decode correctly. `\r\n` line endings
/// are accepted.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block[..pos])) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_block(&String::from_utf8_lossy(&rest))
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event = None;
    let mut id = None;

    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => data_lines.push(value),
            "event" => event = Some(value.trim().to_string()),
            "id" => id = Some(value.trim().to_string()),
            _ => {}
        }
    }

    if data_lines.is_empty() && event.is_none() && id.is_none() {
        return None;
    }

    Some(SseEvent {
        event,
        data: data_lines.join("\n").trim().to_string(),
        id,
    })
}

/// Drive `byte_stream` through an [`SseDecoder`], calling `on_event` for
/// each event until the stream ends, errors, or `cancellation` fires.
pub async fn pump_sse_events<S, F>(byte_stream: S, cancellation: CancellationToken, mut on_event: F)
where
    S: Stream<Item = reqwest::Result<Bytes>>,
    F: FnMut(SseEvent),
{
    let mut decoder = SseDecoder::new();
    tokio::pin!(byte_stream);

    loop {
        let chunk = tokio::select! {
            _ = cancellation.cancelled() => return,
            chunk = byte_stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => decoder.push(&bytes).into_iter().for_each(&mut on_event),
            Some(Err(e)) => {
                tracing::debug!("SSE stream error: {e}");
                break;
            }
            None => break,
        }
    }

    if let Some(event) = decoder.finish() {
        on_event(event);
    }
}

/// Legacy HTTP+SSE MCP transport.
#[derive(Debug)]
pub struct SseTransport {
    http_client: reqwest::Client,
    post_url: url::Url,
    headers: HashMap<String, String>,
    response_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    stream_cancel: CancellationToken,
}

impl SseTransport {
    /// Open the event stream at `url` and wait (up to `timeout`) for the
    /// server to announce its POST endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorError::McpTransport`] if the GET fails, the server
    /// never sends an `endpoint` event, or the endpoint points at another
    /// origin.
    pub async fn connect(
        url: url::Url,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| AggregatorError::McpTransport(format!("HTTP client setup failed: {e}")))?;

        let mut req = http_client
            .get(url.as_str())
            .header("Accept", "text/event-stream");
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = tokio::time::timeout(timeout, req.send())
            .await
            .map_err(|_| AggregatorError::McpTransport(format!("SSE GET to {url} timed out")))?
            .map_err(|e| AggregatorError::McpTransport(format!("SSE GET failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AggregatorError::McpTransport(format!(
                "SSE GET returned HTTP {status}"
            ))
            .into());
        }

        let (response_tx, response_rx) = mpsc::unbounded_channel::<String>();
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let stream_cancel = CancellationToken::new();

        let token = stream_cancel.clone();
        let byte_stream = response.bytes_stream();
        tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            pump_sse_events(byte_stream, token, |event| {
                if event.event.as_deref() == Some("endpoint") {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data);
                    }
                } else if event.is_message() {
                    let _ = response_tx.send(event.data);
                }
            })
            .await;
        });

        let announced = tokio::time::timeout(timeout, endpoint_rx)
            .await
            .map_err(|_| {
                AggregatorError::McpTransport("server did not announce an endpoint".to_string())
            })?
            .map_err(|_| {
                AggregatorError::McpTransport(
                    "event stream closed before the endpoint was announced".to_string(),
                )
            })?;

        let post_url = url.join(&announced).map_err(|e| {
            AggregatorError::McpTransport(format!("invalid endpoint '{announced}': {e}"))
        })?;
        if post_url.origin() != url.origin() {
            stream_cancel.cancel();
            return Err(AggregatorError::McpTransport(format!(
                "endpoint '{post_url}' is not on the origin of '{url}'"
            ))
            .into());
        }

        Ok(Self {
            http_client,
            post_url,
            headers,
            response_rx: Arc::new(Mutex::new(response_rx)),
            stream_cancel,
        })
    }

    /// The URL messages are POSTed to.
    pub fn post_url(&self) -> &url::Url {
        &self.post_url
    }
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    async fn send(&self, message: String) -> Result<()> {
        let mut req = self
            .http_client
            .post(self.post_url.as_str())
            .header("Content-Type", "application/json")
            .body(message);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = req
            .send()
            .await
            .map_err(|e| AggregatorError::McpTransport(format!("HTTP POST failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AggregatorError::McpTransport(format!(
                "HTTP POST returned status {status}"
            ))
            .into());
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
        Box::pin(futures::stream::empty())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.stream_cancel.cancel();
    }
}
