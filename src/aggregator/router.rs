//! Tool call routing
//!
//! Resolves a (possibly namespaced) tool name to one server and its live
//! session, then forwards `tools/call`. Backend-side tool failures come back
//! as results with `is_error` set; routing, transport and timeout failures
//! are raised.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{histogram, increment_counter};
use serde_json::Value;

use crate::aggregator::models::{
    split_namespaced, AggregatedTool, CallMetadata, CallOutcome, ExternalServer, ServerStatus,
    ToolCallResult,
};
use crate::aggregator::registry::ServerRegistry;
use crate::aggregator::session::{ServerSession, SessionManager};
use crate::aggregator::store::Store;
use crate::error::{as_aggregator_error, AggregatorError, Result};
use crate::mcp::types::ToolResponseContent;

/// Where one invocation goes. Recomputed for every call.
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub server: ExternalServer,
    pub tool: AggregatedTool,
    pub session: Arc<ServerSession>,
}

impl RoutingContext {
    pub fn server_id(&self) -> &str {
        &self.server.id
    }

    /// Name the backend knows the tool by.
    pub fn original_tool_name(&self) -> &str {
        &self.tool.original_name
    }
}

/// Routes tool calls to backends.
#[derive(Clone)]
pub struct RequestRouter {
    registry: ServerRegistry,
    sessions: Arc<SessionManager>,
    store: Arc<dyn Store>,
    call_timeout: Duration,
}

impl RequestRouter {
    pub fn new(
        registry: ServerRegistry,
        sessions: Arc<SessionManager>,
        store: Arc<dyn Store>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            sessions,
            store,
            call_timeout,
        }
    }

    /// Resolve `tool_name` to a connected server and its session.
    ///
    /// With `server_id` the server is fixed and a leading `"{name}."` is
    /// stripped. Without it a namespaced name selects the server by name; a
    /// name whose prefix matches no server is looked up as a plain tool name
    /// across all servers.
    pub async fn resolve(&self, tool_name: &str, server_id: Option<&str>) -> Result<RoutingContext> {
        let (server, tool) = match server_id {
            Some(id) => self.resolve_on_server(tool_name, id).await?,
            None => match self.resolve_namespaced(tool_name).await? {
                Some(found) => found,
                None => self.resolve_unnamespaced(tool_name).await?,
            },
        };

        if server.status != ServerStatus::Connected {
            return Err(AggregatorError::ServerUnavailable {
                server: server.name.clone(),
                status: server.status,
            }
            .into());
        }

        let Some(session) = self.sessions.get(&server.id) else {
            tracing::error!(
                server = %server.name,
                server_id = %server.id,
                "Server is CONNECTED but has no live session"
            );
            return Err(AggregatorError::SessionNotFound(server.name.clone()).into());
        };

        Ok(RoutingContext {
            server,
            tool,
            session,
        })
    }

    async fn resolve_on_server(
        &self,
        tool_name: &str,
        server_id: &str,
    ) -> Result<(ExternalServer, AggregatedTool)> {
        let server = self.registry.require(server_id).await?;
        let prefix = format!("{}.", server.name);
        if let Some(stripped) = tool_name.strip_prefix(&prefix) {
            if let Some(tool) = self.store.find_server_tool(&server.id, stripped).await? {
                return Ok((server, tool));
            }
        }
        match self.store.find_server_tool(&server.id, tool_name).await? {
            Some(tool) => Ok((server, tool)),
            None => Err(AggregatorError::ToolNotFound(tool_name.to_string()).into()),
        }
    }

    async fn resolve_namespaced(&self, tool_name: &str) -> Result<Option<(ExternalServer, AggregatedTool)>> {
        let Some((server_name, original)) = split_namespaced(tool_name) else {
            return Ok(None);
        };
        let Some(server) = self.registry.get_by_name(server_name).await? else {
            return Ok(None);
        };
        match self.store.find_server_tool(&server.id, original).await? {
            Some(tool) => Ok(Some((server, tool))),
            None => Err(AggregatorError::ToolNotFound(tool_name.to_string()).into()),
        }
    }

    async fn resolve_unnamespaced(&self, tool_name: &str) -> Result<(ExternalServer, AggregatedTool)> {
        let mut matches = self.store.find_tools_by_original_name(tool_name).await?;
        match matches.len() {
            0 => Err(AggregatorError::ToolNotFound(tool_name.to_string()).into()),
            1 => {
                let tool = matches.remove(0);
                let server = self.registry.require(&tool.source_server_id).await?;
                Ok((server, tool))
            }
            _ => {
                let mut servers: Vec<String> = matches.into_iter().map(|t| t.server_name).collect();
                servers.sort();
                Err(AggregatorError::AmbiguousTool {
                    tool: tool_name.to_string(),
                    servers,
                }
                .into())
            }
        }
    }

    /// Resolve and forward one call.
    pub async fn execute(
        &self,
        tool_name: &str,
        arguments: Option<Value>,
        server_id: Option<&str>,
    ) -> Result<ToolCallResult> {
        let ctx = self.resolve(tool_name, server_id).await?;
        self.forward(&ctx, arguments).await
    }

    /// Try `server_ids` in order, moving on after routing or transport
    /// failures. Backend tool errors are results and end the search.
    pub async fn execute_prioritized(
        &self,
        tool_name: &str,
        arguments: Option<Value>,
        server_ids: &[String],
    ) -> Result<ToolCallResult> {
        let mut last_error = None;
        for server_id in server_ids {
            match self.execute(tool_name, arguments.clone(), Some(server_id)).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    tracing::warn!(tool = tool_name, server_id = %server_id, "Falling back after failure: {e:#}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AggregatorError::Validation("execute_prioritized needs at least one server id".to_string()).into()
        }))
    }

    async fn forward(&self, ctx: &RoutingContext, arguments: Option<Value>) -> Result<ToolCallResult> {
        let server_name = ctx.server.name.clone();
        let started = Instant::now();
        let outcome = ctx
            .session
            .call_tool(ctx.original_tool_name(), arguments, self.call_timeout)
            .await;
        let elapsed = started.elapsed();
        let latency_ms = elapsed.as_millis() as u64;
        histogram!("toolmesh_tool_call_duration_seconds", elapsed.as_secs_f64(), "server" => server_name.clone());

        let (content, structured_content, error_message) = match outcome {
            Ok(response) => {
                let error_message = response
                    .is_error
                    .unwrap_or(false)
                    .then(|| response.text());
                (response.content, response.structured_content, error_message)
            }
            Err(e) => match as_aggregator_error(&e) {
                Some(AggregatorError::Mcp(message)) => (
                    vec![ToolResponseContent::Text { text: message.clone() }],
                    None,
                    Some(message.clone()),
                ),
                _ => {
                    let label = match as_aggregator_error(&e) {
                        Some(AggregatorError::Timeout { .. }) => "timeout",
                        _ => "transport_error",
                    };
                    increment_counter!("toolmesh_tool_calls_total", "server" => server_name.clone(), "outcome" => label);
                    tracing::warn!(
                        tool = %ctx.tool.namespaced_name,
                        server = %server_name,
                        latency_ms,
                        "Tool call failed: {e:#}"
                    );
                    return Err(e);
                }
            },
        };

        let outcome = if error_message.is_some() {
            CallOutcome::ToolError
        } else {
            CallOutcome::Success
        };
        increment_counter!("toolmesh_tool_calls_total", "server" => server_name.clone(), "outcome" => outcome.as_str());
        tracing::info!(
            tool = %ctx.tool.namespaced_name,
            server = %server_name,
            latency_ms,
            outcome = outcome.as_str(),
            "Tool call completed"
        );

        Ok(ToolCallResult {
            tool_name: ctx.tool.namespaced_name.clone(),
            server_id: ctx.server.id.clone(),
            server_name,
            content,
            structured_content,
            is_error: error_message.is_some(),
            error_message,
            metadata: CallMetadata { latency_ms, outcome },
        })
    }
}
