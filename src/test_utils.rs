//! Test utilities for toolmesh
//!
//! This module provides a scripted in-process MCP backend ([`MockBackend`]),
//! a [`TransportFactory`] that hands out connections to such backends
//! ([`FakeTransportFactory`]), and small assertion and config helpers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::aggregator::connector::TransportFactory;
use crate::aggregator::models::ExternalServer;
use crate::error::{AggregatorError, Result};
use crate::mcp::transport::fake::FakeTransport;
use crate::mcp::transport::Transport;
use crate::mcp::types::{LATEST_PROTOCOL_VERSION, NOTIF_TOOLS_LIST_CHANGED};

/// Create a temporary directory for testing
///
/// # Returns
///
/// Returns a TempDir that will be cleaned up when dropped
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

/// Assert that an error contains the expected message
///
/// # Panics
///
/// Panics if the result is Ok or if the error doesn't contain the expected message
pub fn assert_error_contains<T: std::fmt::Debug>(result: Result<T>, expected: &str) {
    match result {
        Ok(v) => panic!("Expected error containing '{}' but got Ok({:?})", expected, v),
        Err(e) => {
            let error_msg = format!("{e:#}");
            assert!(
                error_msg.contains(expected),
                "Error message '{}' does not contain '{}'",
                error_msg,
                expected
            );
        }
    }
}

/// A configuration YAML string exercising every section
pub fn test_config_yaml() -> String {
    r#"
gateway:
  connect_timeout_seconds: 5
  call_timeout_seconds: 10
  discovery_timeout_seconds: 5

health:
  enabled: true
  interval_seconds: 15
  probe_timeout_seconds: 3
  failure_threshold: 2

reconnect:
  base_delay_seconds: 0.5
  max_delay_seconds: 30
  multiplier: 2.0
  jitter_ratio: 0.1

storage:
  backend: memory

servers:
  - name: gh
    transport: http
    config:
      url: http://127.0.0.1:9000/mcp
      headers:
        Authorization: Bearer test
  - name: fs
    transport: stdio
    auto_connect: false
    config:
      command: mcp-server-filesystem
      args: ["/tmp"]
"#
    .to_string()
}

type Connection = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

#[derive(Default)]
struct BackendState {
    tools: Mutex<Vec<Value>>,
    calls: Mutex<Vec<(String, Value)>>,
    is_error_tools: Mutex<HashSet<String>>,
    rpc_error_tools: Mutex<HashSet<String>>,
    connections: Mutex<Vec<Connection>>,
    silent: AtomicBool,
    unresponsive: AtomicBool,
    handshake_delay: Mutex<Duration>,
    list_requests: AtomicUsize,
}

/// Scripted MCP backend answering over [`FakeTransport`].
///
/// Clones share state, so a test can keep one clone to steer the backend
/// while the factory hands connections to the code under test.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<BackendState>,
}

fn tool_json(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("{name} tool"),
        "inputSchema": { "type": "object", "properties": { "value": { "type": "string" } } }
    })
}

impl MockBackend {
    /// A backend exposing `names` as tools.
    pub fn with_tools(names: &[&str]) -> Self {
        let backend = Self::default();
        backend.set_tools(names);
        backend
    }

    /// A backend that never answers anything, including `initialize`.
    pub fn silent() -> Self {
        let backend = Self::default();
        backend.state.silent.store(true, Ordering::SeqCst);
        backend
    }

    /// Delay the `initialize` reply.
    pub fn with_handshake_delay(self, delay: Duration) -> Self {
        self.set_handshake_delay(delay);
        self
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        *self.state.handshake_delay.lock().unwrap() = delay;
    }

    /// Replace the advertised tool list.
    pub fn set_tools(&self, names: &[&str]) {
        *self.state.tools.lock().unwrap() = names.iter().map(|n| tool_json(n)).collect();
    }

    /// Make `name` answer with `isError: true`.
    pub fn fail_tool(&self, name: &str) {
        self.state.is_error_tools.lock().unwrap().insert(name.to_string());
    }

    /// Make `name` answer with a JSON-RPC error.
    pub fn reject_tool(&self, name: &str) {
        self.state.rpc_error_tools.lock().unwrap().insert(name.to_string());
    }

    /// Stop (or resume) answering requests while keeping connections open.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.state.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Hang up every live connection.
    pub fn go_dark(&self) {
        for conn in self.state.connections.lock().unwrap().drain(..) {
            conn.lock().unwrap().take();
        }
    }

    /// Push `notifications/tools/list_changed` on every live connection.
    pub fn announce_list_changed(&self) {
        let message = json!({ "jsonrpc": "2.0", "method": NOTIF_TOOLS_LIST_CHANGED }).to_string();
        for conn in self.state.connections.lock().unwrap().iter() {
            if let Some(tx) = conn.lock().unwrap().as_ref() {
                let _ = tx.send(message.clone());
            }
        }
    }

    /// Every `tools/call` received, as `(tool name, arguments)`.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Number of `tools/list` requests received.
    pub fn list_requests(&self) -> usize {
        self.state.list_requests.load(Ordering::SeqCst)
    }

    /// Open a new connection to this backend.
    pub fn serve(&self) -> FakeTransport {
        let (transport, handle) = FakeTransport::new();
        let mut outbound_rx = handle.outbound_rx;
        let conn: Connection = Arc::new(Mutex::new(Some(handle.inbound_tx)));
        self.state.connections.lock().unwrap().push(Arc::clone(&conn));

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(raw) = outbound_rx.recv().await {
                let Ok(msg) = serde_json::from_str::<Value>(&raw) else {
                    continue;
                };
                let (Some(id), Some(method)) = (msg.get("id").cloned(), msg["method"].as_str()) else {
                    continue;
                };
                if state.silent.load(Ordering::SeqCst) {
                    continue;
                }
                if method == "initialize" {
                    let delay = *state.handshake_delay.lock().unwrap();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                } else if state.unresponsive.load(Ordering::SeqCst) {
                    continue;
                }

                let reply = match answer(&state, method, &msg["params"]) {
                    Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                    Err((code, message)) => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": code, "message": message }
                    }),
                };

                let sent = conn
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|tx| tx.send(reply.to_string()).is_ok())
                    .unwrap_or(false);
                if !sent {
                    break;
                }
            }
        });

        transport
    }
}

fn answer(state: &BackendState, method: &str, params: &Value) -> std::result::Result<Value, (i64, String)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": true } },
            "serverInfo": { "name": "mock-backend", "version": "0.0.1" }
        })),
        "ping" => Ok(json!({})),
        "tools/list" => {
            state.list_requests.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "tools": *state.tools.lock().unwrap() }))
        }
        "tools/call" => {
            let name = params["name"].as_str().unwrap_or_default().to_string();
            let args = params.get("arguments").cloned().unwrap_or(Value::Null);
            state.calls.lock().unwrap().push((name.clone(), args.clone()));

            let known = state
                .tools
                .lock()
                .unwrap()
                .iter()
                .any(|t| t["name"] == name.as_str());
            if !known {
                return Err((-32602, format!("Unknown tool: {name}")));
            }
            if state.rpc_error_tools.lock().unwrap().contains(&name) {
                return Err((-32000, format!("{name} exploded")));
            }
            if state.is_error_tools.lock().unwrap().contains(&name) {
                return Ok(json!({
                    "content": [{ "type": "text", "text": format!("{name} failed") }],
                    "isError": true
                }));
            }
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{name} -> {args}") }],
                "isError": false
            }))
        }
        other => Err((-32601, format!("Method not found: {other}"))),
    }
}

/// Transport factory connecting servers to [`MockBackend`]s by server name.
#[derive(Default)]
pub struct FakeTransportFactory {
    backends: Mutex<HashMap<String, MockBackend>>,
    refused: Mutex<HashSet<String>>,
    opens: Mutex<HashMap<String, usize>>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route connections for server `name` to `backend`.
    pub fn add_backend(&self, name: &str, backend: MockBackend) {
        self.backends.lock().unwrap().insert(name.to_string(), backend);
    }

    /// Make opening a transport for `name` fail (or succeed again).
    pub fn refuse(&self, name: &str, refused: bool) {
        let mut set = self.refused.lock().unwrap();
        if refused {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// How many transports were opened for `name`.
    pub fn open_count(&self, name: &str) -> usize {
        self.opens.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn open(&self, server: &ExternalServer) -> Result<Arc<dyn Transport>> {
        *self
            .opens
            .lock()
            .unwrap()
            .entry(server.name.clone())
            .or_insert(0) += 1;

        if self.refused.lock().unwrap().contains(&server.name) {
            return Err(AggregatorError::McpTransport("connection refused".into()).into());
        }
        let backend = self
            .backends
            .lock()
            .unwrap()
            .get(&server.name)
            .cloned()
            .ok_or_else(|| AggregatorError::McpTransport(format!("no backend named {}", server.name)))?;
        Ok(Arc::new(backend.serve()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::attach;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_temp_dir_creation() {
        let dir = temp_dir();
        assert!(dir.path().exists());
    }

    #[test]
    #[should_panic(expected = "does not contain")]
    fn test_assert_error_contains_wrong_message() {
        let result: Result<()> = Err(AggregatorError::Config("different".into()).into());
        assert_error_contains(result, "not present");
    }

    #[tokio::test]
    async fn test_mock_backend_answers_tool_calls() {
        let backend = MockBackend::with_tools(&["echo"]);
        let client = attach(Arc::new(backend.serve()), CancellationToken::new(), "mock");

        let result: Value = client
            .request(
                "tools/call",
                json!({ "name": "echo", "arguments": { "value": "x" } }),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(result["isError"], false);
        assert_eq!(backend.calls().len(), 1);
    }
}
