//! MCP transport abstraction and implementations
//!
//! This module defines the [`Transport`] trait that all MCP transport
//! implementations must satisfy. Concrete implementations live in
//! submodules:
//!
//! - [`stdio::StdioTransport`] -- spawns a child process and communicates
//!   over its stdin/stdout pipes (newline-delimited JSON).
//! - [`sse::SseTransport`] -- legacy HTTP+SSE transport: a long-lived GET
//!   event stream plus a POST endpoint announced by the server.
//! - [`http::HttpTransport`] -- Streamable HTTP transport (POST with a JSON
//!   or SSE reply).
//! - `fake::FakeTransport` -- in-process fake used in unit tests.
//!
//! Callers `send` a serialized JSON-RPC string and `receive` a stream of
//! serialized JSON-RPC strings (one per logical message). Framing and
//! transport-level session state belong to each implementation. The
//! `receive_err` stream carries diagnostics such as child stderr and is never
//! treated as an error condition.
//!
//! [`attach`] bridges a transport to a [`JsonRpcClient`].

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::mcp::client::{start_read_loop, transport_failure_reply, JsonRpcClient};

/// Abstraction over MCP transport implementations.
///
/// Used polymorphically through `Arc<dyn Transport>`. Dropping the last
/// reference tears the underlying connection or process down.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send a complete JSON-RPC message string to the remote peer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::AggregatorError::McpTransport`] if the
    /// underlying I/O operation fails.
    async fn send(&self, message: String) -> Result<()>;

    /// Returns a stream of inbound JSON-RPC message strings.
    ///
    /// The stream ends when the transport is closed or the remote peer
    /// disconnects.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>>;

    /// Returns a stream of transport-level diagnostic strings.
    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>>;
}

/// Wire `transport` to a fresh [`JsonRpcClient`] and start its read loop.
///
/// Three background tasks are spawned: an outbound pump, an inbound pump, and
/// a diagnostics drain. All of them stop when `cancellation` fires. When the
/// peer closes its inbound stream the token is cancelled too, so
/// `cancellation.is_cancelled()` doubles as "connection lost".
///
/// `label` names the peer in diagnostic logs.
pub fn attach(
    transport: Arc<dyn Transport>,
    cancellation: CancellationToken,
    label: &str,
) -> JsonRpcClient {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

    let shared = Arc::new(JsonRpcClient::new(out_tx));
    start_read_loop(in_rx, cancellation.clone(), Arc::clone(&shared));

    let sender = Arc::clone(&transport);
    let token = cancellation.clone();
    let peer = label.to_string();
    let failures = in_tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                maybe_msg = out_rx.recv() => {
                    let Some(msg) = maybe_msg else { break };
                    if let Err(e) = sender.send(msg.clone()).await {
                        tracing::warn!(server = %peer, "MCP send failed: {e}");
                        // Fail the waiting request now instead of at its deadline.
                        if let Some(reply) = transport_failure_reply(&msg, &e.to_string()) {
                            let _ = failures.send(reply);
                        }
                    }
                }
            }
        }
    });

    let receiver = Arc::clone(&transport);
    let token = cancellation.clone();
    let peer = label.to_string();
    tokio::spawn(async move {
        let mut stream = receiver.receive();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                maybe_msg = stream.next() => match maybe_msg {
                    Some(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    None => {
                        tracing::info!(server = %peer, "MCP peer closed the connection");
                        token.cancel();
                        break;
                    }
                }
            }
        }
    });

    let token = cancellation;
    let peer = label.to_string();
    tokio::spawn(async move {
        let mut stream = transport.receive_err();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                maybe_line = stream.next() => match maybe_line {
                    Some(line) => tracing::debug!(server = %peer, "mcp server stderr: {line}"),
                    None => break,
                }
            }
        }
    });

    shared.clone_shared()
}

pub mod http;
pub mod sse;
pub mod stdio;

#[cfg(test)]
pub mod fake;
