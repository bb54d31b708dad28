//! Transport-agnostic async JSON-RPC 2.0 client
//!
//! This module provides [`JsonRpcClient`], a channel-backed JSON-RPC 2.0 client
//! that is completely decoupled from the underlying transport. Callers wire up
//! two [`tokio::sync::mpsc`] channels (one for outbound serialized messages, one
//! for inbound serialized messages) and then call [`start_read_loop`] to process
//! responses and notifications concurrently.
//!
//! # Design
//!
//! - Outbound messages are written to `outbound_tx` as newline-free JSON strings.
//!   The transport layer is responsible for framing.
//! - Inbound messages arrive on `inbound_rx` as JSON strings. The read loop
//!   classifies each message as a response, a server-initiated request, or a
//!   notification and dispatches accordingly.
//! - In-flight requests are tracked in a `pending` map keyed by `u64` request ID.
//!   A request that times out removes its own entry.
//! - A [`tokio_util::sync::CancellationToken`] stops the read loop cleanly and
//!   drops all pending senders so that awaiting callers receive an error.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{AggregatorError, Result};
use crate::mcp::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Default timeout applied to every request when the caller does not specify one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error code of the synthetic reply injected when a request could not be
/// delivered by the transport.
pub const TRANSPORT_FAILURE_CODE: i64 = -32099;

const TRANSPORT_FAILURE_SOURCE: &str = "transport";

/// Build the synthetic error reply for a request that the transport failed
/// to deliver. Returns `None` for notifications and unparsable messages.
pub fn transport_failure_reply(raw_request: &str, reason: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_request).ok()?;
    let id = value.get("id").filter(|id| !id.is_null())?.clone();
    value.get("method")?;
    serde_json::to_string(&JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id: Some(id),
        result: None,
        error: Some(JsonRpcError {
            code: TRANSPORT_FAILURE_CODE,
            message: reason.to_string(),
            data: Some(serde_json::json!({ "source": TRANSPORT_FAILURE_SOURCE })),
        }),
    })
    .ok()
}

fn is_transport_failure(error: &JsonRpcError) -> bool {
    error.code == TRANSPORT_FAILURE_CODE
        && error
            .data
            .as_ref()
            .and_then(|d| d.get("source"))
            .and_then(|s| s.as_str())
            == Some(TRANSPORT_FAILURE_SOURCE)
}

/// Convenience alias for a boxed, `Send`-safe async future.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

type NotificationHandler = Box<dyn Fn(serde_json::Value) + Send + Sync + 'static>;

type ServerRequestHandler =
    Box<dyn Fn(serde_json::Value) -> BoxFuture<'static, serde_json::Value> + Send + Sync + 'static>;

type PendingMap =
    HashMap<u64, oneshot::Sender<std::result::Result<serde_json::Value, JsonRpcError>>>;

/// Transport-agnostic async JSON-RPC 2.0 client.
///
/// Create one with [`JsonRpcClient::new`], passing the outbound channel sender.
/// Then call [`start_read_loop`] to process incoming messages. Issue requests
/// with [`JsonRpcClient::request`] and fire-and-forget notifications with
/// [`JsonRpcClient::notify`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
/// use toolmesh::mcp::client::{JsonRpcClient, start_read_loop};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let (out_tx, _out_rx) = mpsc::unbounded_channel::<String>();
///     let (_in_tx, in_rx) = mpsc::unbounded_channel::<String>();
///     let token = CancellationToken::new();
///     let client = Arc::new(JsonRpcClient::new(out_tx));
///     let _handle = start_read_loop(in_rx, token, Arc::clone(&client));
///     Ok(())
/// }
/// ```
pub struct JsonRpcClient {
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<PendingMap>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    notification_handlers: Arc<std::sync::Mutex<HashMap<String, NotificationHandler>>>,
    server_request_handlers: Arc<std::sync::Mutex<HashMap<String, ServerRequestHandler>>>,
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl JsonRpcClient {
    /// Create a new `JsonRpcClient`.
    ///
    /// The caller is responsible for wiring the receiver of `outbound_tx` to a
    /// transport writer and for calling [`start_read_loop`] with the
    /// corresponding inbound receiver.
    pub fn new(outbound_tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outbound_tx,
            notification_handlers: Arc::new(std::sync::Mutex::new(HashMap::new())),
            server_request_handlers: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Create a new [`JsonRpcClient`] that shares all internal state with
    /// `self`.
    ///
    /// A read loop started with an `Arc<JsonRpcClient>` resolves responses for
    /// requests issued through any client sharing its pending map. This is how
    /// [`crate::mcp::protocol::McpProtocol`], which owns its client by value,
    /// is wired to [`start_read_loop`].
    pub fn clone_shared(&self) -> Self {
        Self {
            next_id: Arc::clone(&self.next_id),
            pending: Arc::clone(&self.pending),
            outbound_tx: self.outbound_tx.clone(),
            notification_handlers: Arc::clone(&self.notification_handlers),
            server_request_handlers: Arc::clone(&self.server_request_handlers),
        }
    }

    /// Send a JSON-RPC request and await the typed response.
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorError::McpTransport`] if the outbound channel is closed
    /// or the read loop exits before the response arrives.
    /// Returns [`AggregatorError::McpTimeout`] if no response arrives within the timeout.
    /// Returns [`AggregatorError::Mcp`] if the server returns an error response.
    /// Returns [`AggregatorError::Serialization`] if serialization or deserialization fails.
    pub async fn request<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        P: serde::Serialize + Send,
        R: serde::de::DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        // Register before sending so the response can never beat the slot.
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let message = serde_json::to_string(&JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(serde_json::json!(id)),
            method: method.to_string(),
            params: Some(serde_json::to_value(params)?),
        })?;

        if self.outbound_tx.send(message).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(AggregatorError::McpTransport("outbound channel closed".to_string()).into());
        }

        let deadline = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let outcome = match tokio::time::timeout(deadline, rx).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(AggregatorError::McpTimeout {
                    method: method.to_string(),
                }
                .into());
            }
        };

        let rpc_result = outcome.map_err(|_| {
            AggregatorError::McpTransport("read loop exited before response arrived".to_string())
        })?;

        let value = rpc_result.map_err(|e| {
            if is_transport_failure(&e) {
                AggregatorError::McpTransport(e.message)
            } else {
                AggregatorError::Mcp(e.message)
            }
        })?;

        serde_json::from_value(value).map_err(|e| AggregatorError::Serialization(e).into())
    }

    /// Send a JSON-RPC notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorError::McpTransport`] if the outbound channel is closed.
    pub fn notify<P: serde::Serialize + Send>(&self, method: &str, params: P) -> Result<()> {
        let message = serde_json::to_string(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": serde_json::to_value(params)?
        }))?;

        self.outbound_tx
            .send(message)
            .map_err(|_| AggregatorError::McpTransport("outbound channel closed".to_string()))?;

        Ok(())
    }

    /// Register a handler for a server-sent notification.
    ///
    /// The handler runs on the read loop and must not block. Registering a
    /// second handler for the same method replaces the first.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokio::sync::mpsc;
    /// use toolmesh::mcp::client::JsonRpcClient;
    /// use toolmesh::mcp::types::NOTIF_TOOLS_LIST_CHANGED;
    ///
    /// let (tx, _rx) = mpsc::unbounded_channel::<String>();
    /// let client = JsonRpcClient::new(tx);
    /// client.on_notification(NOTIF_TOOLS_LIST_CHANGED, |_params| {
    ///     // refresh tool list
    /// });
    /// ```
    pub fn on_notification(
        &self,
        method: impl Into<String>,
        f: impl Fn(serde_json::Value) + Send + Sync + 'static,
    ) {
        if let Ok(mut handlers) = self.notification_handlers.lock() {
            handlers.insert(method.into(), Box::new(f));
        }
    }

    /// Register a handler for a server-initiated request.
    ///
    /// The handler's return value is sent back as the `result` of a JSON-RPC
    /// response. Methods without a handler are answered with `-32601`.
    pub fn on_server_request(
        &self,
        method: impl Into<String>,
        f: impl Fn(serde_json::Value) -> BoxFuture<'static, serde_json::Value> + Send + Sync + 'static,
    ) {
        if let Ok(mut handlers) = self.server_request_handlers.lock() {
            handlers.insert(method.into(), Box::new(f));
        }
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Start the JSON-RPC read loop as a background Tokio task.
///
/// The loop reads serialized JSON strings from `inbound_rx`, classifies each
/// message, and dispatches it:
///
/// - **Response** (has `"id"` and `"result"` or `"error"`): resolves the
///   matching pending [`oneshot`] sender.
/// - **Server-initiated request** (has `"id"` and `"method"`): calls the
///   registered handler and sends a `JsonRpcResponse` back on `outbound_tx`.
/// - **Notification** (has `"method"` but no `"id"`): calls the registered
///   handler, if any.
///
/// On cancellation or when the inbound channel closes, all pending senders
/// are dropped so that in-flight `request()` calls fail instead of hanging.
pub fn start_read_loop(
    mut inbound_rx: mpsc::UnboundedReceiver<String>,
    cancellation: CancellationToken,
    client: Arc<JsonRpcClient>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = cancellation.cancelled() => {
                    client.pending.lock().await.clear();
                    break;
                }

                maybe_msg = inbound_rx.recv() => {
                    let Some(raw) = maybe_msg else {
                        client.pending.lock().await.clear();
                        break;
                    };
                    dispatch_message(&raw, &client).await;
                }
            }
        }
    })
}

async fn dispatch_message(raw: &str, client: &Arc<JsonRpcClient>) {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("MCP read loop: failed to parse inbound JSON: {e}");
            return;
        }
    };

    let has_id = value.get("id").is_some_and(|id| !id.is_null());
    let has_method = value.get("method").is_some();
    let has_result = value.get("result").is_some();
    let has_error = value.get("error").is_some();

    if has_id && (has_result || has_error) && !has_method {
        handle_response(value, client).await;
    } else if has_id && has_method {
        handle_server_request(value, client).await;
    } else if has_method && !has_id {
        handle_notification(value, client);
    } else if has_error {
        // Errors with a null id answer requests the peer could not parse.
        tracing::warn!("MCP read loop: uncorrelated error from peer: {}", value["error"]);
    } else {
        tracing::debug!(
            "MCP read loop: received unclassifiable message; ignoring. \
             has_id={has_id} has_method={has_method} has_result={has_result}"
        );
    }
}

async fn handle_response(value: serde_json::Value, client: &Arc<JsonRpcClient>) {
    let id_val = &value["id"];
    let id = match id_val
        .as_u64()
        .or_else(|| id_val.as_str().and_then(|s| s.parse::<u64>().ok()))
    {
        Some(id) => id,
        None => {
            tracing::warn!("MCP read loop: response has non-integer id: {id_val}");
            return;
        }
    };

    let Some(tx) = client.pending.lock().await.remove(&id) else {
        tracing::debug!("MCP read loop: received response for unknown id {id}; ignoring");
        return;
    };

    let outcome = match value.get("error") {
        Some(error_val) => Err(serde_json::from_value::<JsonRpcError>(error_val.clone())
            .unwrap_or_else(|_| JsonRpcError {
                code: -32603,
                message: format!("malformed error object: {error_val}"),
                data: None,
            })),
        None => Ok(value
            .get("result")
            .cloned()
            .unwrap_or(serde_json::Value::Null)),
    };

    // The caller may have already timed out.
    let _ = tx.send(outcome);
}

async fn handle_server_request(value: serde_json::Value, client: &Arc<JsonRpcClient>) {
    let Some(method) = value.get("method").and_then(|m| m.as_str()) else {
        return;
    };
    let method = method.to_string();
    let id = value.get("id").cloned().unwrap_or(serde_json::Value::Null);
    let params = value
        .get("params")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    // Release the handler lock before awaiting the handler's future.
    let handler_future = client
        .server_request_handlers
        .lock()
        .ok()
        .and_then(|handlers| handlers.get(&method).map(|h| h(params)));

    let response = match handler_future {
        Some(future) => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(future.await),
            error: None,
        },
        None => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: format!("Method not found: {method}"),
                data: None,
            }),
        },
    };

    if let Ok(serialized) = serde_json::to_string(&response) {
        let _ = client.outbound_tx.send(serialized);
    }
}

fn handle_notification(value: serde_json::Value, client: &Arc<JsonRpcClient>) {
    let Some(method) = value.get("method").and_then(|m| m.as_str()) else {
        return;
    };
    let params = value
        .get("params")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    let Ok(handlers) = client.notification_handlers.lock() else {
        return;
    };
    match handlers.get(method) {
        Some(handler) => handler(params),
        None => tracing::debug!("MCP read loop: no handler for notification '{method}'; ignoring"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
