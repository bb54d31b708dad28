//! Typed MCP lifecycle wrapper over [`JsonRpcClient`]
//!
//! This module provides two types that represent the two phases of an MCP
//! client session:
//!
//! - [`McpProtocol`] -- an uninitialized client. Call [`McpProtocol::initialize`]
//!   to perform the JSON-RPC `initialize` / `notifications/initialized`
//!   handshake and receive an [`InitializedMcpProtocol`].
//! - [`InitializedMcpProtocol`] -- a fully negotiated session exposing the
//!   calls the gateway relies on: `tools/list`, `tools/call` and `ping`.
//!
//! `list_tools` follows `nextCursor` until the server stops returning one,
//! accumulating results before returning. Neither type owns a transport;
//! callers wire up channels externally and pass the resulting
//! [`JsonRpcClient`] into [`McpProtocol::new`].

use std::time::Duration;

use crate::error::{AggregatorError, Result};
use crate::mcp::client::JsonRpcClient;
use crate::mcp::types::{
    CallToolParams, CallToolResponse, ClientCapabilities, Implementation, InitializeParams,
    InitializeResponse, ListToolsResponse, McpTool, PaginatedParams, LATEST_PROTOCOL_VERSION,
    METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
    SUPPORTED_PROTOCOL_VERSIONS,
};

/// Upper bound on `tools/list` pages followed in one listing.
pub const MAX_LIST_PAGES: usize = 100;

/// An uninitialized MCP client session.
///
/// # Examples
///
/// ```
/// use tokio::sync::mpsc;
/// use toolmesh::mcp::client::JsonRpcClient;
/// use toolmesh::mcp::protocol::McpProtocol;
///
/// let (tx, _rx) = mpsc::unbounded_channel::<String>();
/// let _proto = McpProtocol::new(JsonRpcClient::new(tx));
/// ```
#[derive(Debug)]
pub struct McpProtocol {
    client: JsonRpcClient,
}

impl McpProtocol {
    /// Create a new uninitialized MCP protocol session.
    ///
    /// The caller must already have started
    /// [`crate::mcp::client::start_read_loop`] for `client`.
    pub fn new(client: JsonRpcClient) -> Self {
        Self { client }
    }

    /// Perform the MCP `initialize` / `notifications/initialized` handshake.
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorError::McpProtocolVersion`] if the server returns a
    /// protocol version that is not in [`SUPPORTED_PROTOCOL_VERSIONS`], and
    /// propagates transport, timeout and JSON-RPC failures.
    pub async fn initialize(
        self,
        client_info: Implementation,
        capabilities: ClientCapabilities,
        timeout: Option<Duration>,
    ) -> Result<InitializedMcpProtocol> {
        let response: InitializeResponse = self
            .client
            .request(
                METHOD_INITIALIZE,
                InitializeParams {
                    protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                    capabilities,
                    client_info,
                },
                timeout,
            )
            .await?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&response.protocol_version.as_str()) {
            return Err(AggregatorError::McpProtocolVersion {
                expected: SUPPORTED_PROTOCOL_VERSIONS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                got: response.protocol_version,
            }
            .into());
        }

        self.client
            .notify(METHOD_INITIALIZED, serde_json::json!({}))?;

        Ok(InitializedMcpProtocol {
            client: self.client,
            initialize_response: response,
        })
    }
}

/// A fully negotiated MCP client session.
#[derive(Debug)]
pub struct InitializedMcpProtocol {
    /// The underlying JSON-RPC client.
    pub client: JsonRpcClient,
    /// The server's response to the `initialize` request.
    pub initialize_response: InitializeResponse,
}

impl InitializedMcpProtocol {
    /// Identity reported by the server during the handshake.
    pub fn server_info(&self) -> &Implementation {
        &self.initialize_response.server_info
    }

    /// List all tools advertised by the server, following pagination.
    ///
    /// `timeout` bounds each page request.
    ///
    /// # Errors
    ///
    /// Returns an error if any paged request fails, or
    /// [`AggregatorError::Mcp`] if the server keeps paginating past
    /// [`MAX_LIST_PAGES`] or repeats a cursor.
    pub async fn list_tools(&self, timeout: Option<Duration>) -> Result<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let resp: ListToolsResponse = self
                .client
                .request(
                    METHOD_TOOLS_LIST,
                    PaginatedParams {
                        cursor: cursor.clone(),
                    },
                    timeout,
                )
                .await?;

            tools.extend(resp.tools);

            match resp.next_cursor {
                Some(next) if !next.is_empty() => {
                    if cursor.as_deref() == Some(next.as_str()) {
                        return Err(AggregatorError::Mcp(format!(
                            "tools/list returned the same cursor twice: {next}"
                        ))
                        .into());
                    }
                    cursor = Some(next);
                }
                _ => return Ok(tools),
            }
        }

        Err(AggregatorError::Mcp(format!(
            "tools/list did not finish within {MAX_LIST_PAGES} pages"
        ))
        .into())
    }

    /// Invoke a named tool on the server.
    ///
    /// A tool that fails on its own terms comes back as `Ok` with
    /// `is_error: Some(true)`; a JSON-RPC error reply becomes
    /// [`AggregatorError::Mcp`].
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResponse> {
        self.client
            .request(
                METHOD_TOOLS_CALL,
                CallToolParams {
                    name: name.to_string(),
                    arguments,
                },
                timeout,
            )
            .await
    }

    /// Send a `ping` and wait for the empty reply.
    pub async fn ping(&self, timeout: Option<Duration>) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .request(METHOD_PING, serde_json::json!({}), timeout)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::client::start_read_loop;
    use crate::mcp::types::{ServerCapabilities, PROTOCOL_VERSION_2024_11_05};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Build a wired `JsonRpcClient` sharing its pending map with a read loop.
    ///
    /// Returns `(client, server_outbound_rx, server_inbound_tx, cancel_token)`.
    fn wired_client() -> (
        JsonRpcClient,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<String>,
        CancellationToken,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let token = CancellationToken::new();
        let shared = Arc::new(JsonRpcClient::new(out_tx));
        start_read_loop(in_rx, token.clone(), Arc::clone(&shared));
        (shared.clone_shared(), out_rx, in_tx, token)
    }

    fn wired_session() -> (
        InitializedMcpProtocol,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<String>,
        CancellationToken,
    ) {
        let (client, out_rx, in_tx, token) = wired_client();
        let session = InitializedMcpProtocol {
            client,
            initialize_response: InitializeResponse {
                protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                capabilities: ServerCapabilities::default(),
                server_info: Implementation {
                    name: "mock".to_string(),
                    version: "1.0".to_string(),
                    description: None,
                },
                instructions: None,
            },
        };
        (session, out_rx, in_tx, token)
    }

    fn client_info() -> Implementation {
        Implementation {
            name: "toolmesh".to_string(),
            version: "0.1.0".to_string(),
            description: None,
        }
    }

    async fn reply(
        out_rx: &mut mpsc::UnboundedReceiver<String>,
        in_tx: &mpsc::UnboundedSender<String>,
        result: serde_json::Value,
    ) -> serde_json::Value {
        let raw = out_rx.recv().await.unwrap();
        let req: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let resp = serde_json::json!({ "jsonrpc": "2.0", "id": req["id"], "result": result });
        in_tx.send(resp.to_string()).unwrap();
        req
    }

    #[tokio::test]
    async fn test_initialize_rejects_unsupported_protocol_version() {
        let (client, mut out_rx, in_tx, ct) = wired_client();

        tokio::spawn(async move {
            reply(
                &mut out_rx,
                &in_tx,
                serde_json::json!({
                    "protocolVersion": "1999-01-01",
                    "capabilities": {},
                    "serverInfo": { "name": "old-server", "version": "0.0.1" }
                }),
            )
            .await;
        });

        let err = McpProtocol::new(client)
            .initialize(client_info(), ClientCapabilities::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggregatorError>(),
            Some(AggregatorError::McpProtocolVersion { got, .. }) if got == "1999-01-01"
        ));
        ct.cancel();
    }

    #[tokio::test]
    async fn test_initialize_sends_initialized_notification() {
        let (client, mut out_rx, in_tx, ct) = wired_client();

        let server = tokio::spawn(async move {
            let req = reply(
                &mut out_rx,
                &in_tx,
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION_2024_11_05,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "test-server", "version": "1.0.0" }
                }),
            )
            .await;
            assert_eq!(req["method"], METHOD_INITIALIZE);
            assert_eq!(req["params"]["clientInfo"]["name"], "toolmesh");
            let notif: serde_json::Value =
                serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
            assert_eq!(notif["method"], METHOD_INITIALIZED);
            assert!(notif.get("id").is_none());
        });

        let session = McpProtocol::new(client)
            .initialize(client_info(), ClientCapabilities::default(), None)
            .await
            .unwrap();
        assert_eq!(session.server_info().name, "test-server");
        server.await.unwrap();
        ct.cancel();
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor_pagination() {
        let (session, mut out_rx, in_tx, ct) = wired_session();

        tokio::spawn(async move {
            let first = reply(
                &mut out_rx,
                &in_tx,
                serde_json::json!({
                    "tools": [{ "name": "tool_a", "inputSchema": {} }],
                    "nextCursor": "page2"
                }),
            )
            .await;
            assert!(first["params"].get("cursor").is_none());
            let second = reply(
                &mut out_rx,
                &in_tx,
                serde_json::json!({
                    "tools": [{ "name": "tool_b", "inputSchema": {} }],
                    "nextCursor": null
                }),
            )
            .await;
            assert_eq!(second["params"]["cursor"], "page2");
        });

        let tools = session.list_tools(None).await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["tool_a", "tool_b"]);
        ct.cancel();
    }

    #[tokio::test]
    async fn test_list_tools_rejects_repeated_cursor() {
        let (session, mut out_rx, in_tx, ct) = wired_session();

        tokio::spawn(async move {
            for _ in 0..2 {
                reply(
                    &mut out_rx,
                    &in_tx,
                    serde_json::json!({ "tools": [], "nextCursor": "same" }),
                )
                .await;
            }
        });

        let err = session.list_tools(None).await.unwrap_err();
        assert!(err.to_string().contains("same cursor"));
        ct.cancel();
    }

    #[tokio::test]
    async fn test_call_tool_returns_tool_error_as_result() {
        let (session, mut out_rx, in_tx, ct) = wired_session();

        tokio::spawn(async move {
            let req = reply(
                &mut out_rx,
                &in_tx,
                serde_json::json!({
                    "content": [{ "type": "text", "text": "repo not found" }],
                    "isError": true
                }),
            )
            .await;
            assert_eq!(req["params"]["name"], "create_issue");
            assert_eq!(req["params"]["arguments"]["title"], "bug");
        });

        let resp = session
            .call_tool(
                "create_issue",
                Some(serde_json::json!({ "title": "bug" })),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(resp.is_error, Some(true));
        assert_eq!(resp.text(), "repo not found");
        ct.cancel();
    }

    #[tokio::test]
    async fn test_ping_times_out_without_reply() {
        let (session, _out_rx, _in_tx, ct) = wired_session();
        let err = session
            .ping(Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggregatorError>(),
            Some(AggregatorError::McpTimeout { .. })
        ));
        ct.cancel();
    }
}
