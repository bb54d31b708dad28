//! Data model shared by the aggregator components
//!
//! Records that are persisted ([`ExternalServer`], [`AggregatedTool`]) and
//! views derived on demand ([`AggregatorState`], [`ServerDiagnostics`]).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AggregatorError;
use crate::mcp::types::ToolResponseContent;

/// Separator between a server name and a tool name in a namespaced name.
pub const NAMESPACE_SEPARATOR: char = '.';

/// Build the catalog name `"{server}.{tool}"`.
///
/// # Examples
///
/// ```
/// use toolmesh::aggregator::models::namespaced_name;
///
/// assert_eq!(namespaced_name("gh", "create_issue"), "gh.create_issue");
/// ```
pub fn namespaced_name(server_name: &str, tool_name: &str) -> String {
    format!("{server_name}{NAMESPACE_SEPARATOR}{tool_name}")
}

/// Split on the first separator into `(server_name, tool_name)`.
///
/// Returns `None` when the name has no separator or either side is empty.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    let (server, tool) = name.split_once(NAMESPACE_SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// How the gateway reaches a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON over stdin/stdout
    Stdio,
    /// Legacy HTTP+SSE: GET event stream plus POST endpoint
    Sse,
    /// Streamable HTTP
    Http,
}

impl TransportKind {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::Http => "http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = AggregatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "sse" => Ok(TransportKind::Sse),
            "http" | "streamable-http" | "streamable_http" => Ok(TransportKind::Http),
            other => Err(AggregatorError::Validation(format!(
                "unknown transport kind '{other}' (expected stdio, sse or http)"
            ))),
        }
    }
}

/// Connection status of a backend server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    /// No session; initial state and the state after an explicit close
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Live session, routable
    Connected,
    /// Connect failed or health probes crossed the failure threshold
    Error,
}

impl ServerStatus {
    /// Uppercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Disconnected => "DISCONNECTED",
            ServerStatus::Connecting => "CONNECTING",
            ServerStatus::Connected => "CONNECTED",
            ServerStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerStatus {
    type Err = AggregatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DISCONNECTED" => Ok(ServerStatus::Disconnected),
            "CONNECTING" => Ok(ServerStatus::Connecting),
            "CONNECTED" => Ok(ServerStatus::Connected),
            "ERROR" => Ok(ServerStatus::Error),
            other => Err(AggregatorError::Validation(format!(
                "unknown server status '{other}'"
            ))),
        }
    }
}

/// A registered backend server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalServer {
    /// Stable identifier (UUID v4)
    pub id: String,
    /// Unique human-chosen name, used as the tool namespace
    pub name: String,
    /// Transport used to reach the server
    pub transport_kind: TransportKind,
    /// Transport-specific settings (see `connector`)
    pub connection_config: serde_json::Value,
    /// Current status; mutated only through the registry
    pub status: ServerStatus,
    /// Optional HTTP endpoint probed instead of `tools/list`
    pub health_check_url: Option<String>,
    /// Failed probes since the last success
    pub consecutive_failures: u32,
    /// Tools discovered at the last successful discovery
    pub tool_count: usize,
    /// Connect when registered and when the gateway restarts
    pub auto_connect: bool,
    /// Last connect or probe failure
    pub last_error: Option<String>,
    /// When the server was registered
    pub registered_at: DateTime<Utc>,
    /// When the current session was established
    pub connected_at: Option<DateTime<Utc>>,
    /// When the last health probe ran
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Input to [`crate::aggregator::registry::ServerRegistry::register`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRegistration {
    /// Unique server name
    pub name: String,
    /// Transport used to reach the server
    #[serde(rename = "transport")]
    pub transport_kind: TransportKind,
    /// Transport-specific settings
    #[serde(default = "empty_object", rename = "config")]
    pub connection_config: serde_json::Value,
    /// Optional HTTP health endpoint
    #[serde(default)]
    pub health_check_url: Option<String>,
    /// Connect immediately after registration
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

fn default_auto_connect() -> bool {
    true
}

impl ServerRegistration {
    /// Registration with `auto_connect` enabled and no health URL.
    pub fn new(
        name: impl Into<String>,
        transport_kind: TransportKind,
        connection_config: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            transport_kind,
            connection_config,
            health_check_url: None,
            auto_connect: true,
        }
    }

    /// Set the HTTP health endpoint.
    pub fn with_health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    /// Set whether to connect right away.
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }
}

/// Result of external classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolClassification {
    /// Skill categories the tool belongs to
    pub skill_ids: Vec<String>,
    /// Most relevant skill, if any
    pub primary_skill: Option<String>,
    /// Classifier confidence in `[0, 1]`
    pub confidence: f32,
}

/// A tool in the aggregated catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedTool {
    /// Stable identifier, preserved across re-discovery
    pub id: String,
    /// Owning server
    pub source_server_id: String,
    /// Owning server name (denormalized for display)
    pub server_name: String,
    /// Name as the backend reports it
    pub original_name: String,
    /// `"{server_name}.{original_name}"`
    pub namespaced_name: String,
    /// Backend-supplied description
    pub description: Option<String>,
    /// JSON Schema for the arguments
    pub input_schema: serde_json::Value,
    /// Whether classification has been merged
    pub is_classified: bool,
    /// Merged classification, if any
    pub classification: Option<ToolClassification>,
    /// First discovery
    pub discovered_at: DateTime<Utc>,
    /// Last re-discovery
    pub updated_at: DateTime<Utc>,
}

impl AggregatedTool {
    /// Whether the discovery-owned fields differ from `other`.
    pub fn discovery_differs(&self, other: &AggregatedTool) -> bool {
        self.description != other.description
            || self.input_schema != other.input_schema
            || self.namespaced_name != other.namespaced_name
    }
}

/// Derived counts over the registry and catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorState {
    /// Registered servers
    pub total_servers: usize,
    /// Servers in CONNECTED
    pub connected_servers: usize,
    /// Servers in CONNECTING
    pub connecting_servers: usize,
    /// Servers in DISCONNECTED
    pub disconnected_servers: usize,
    /// Servers in ERROR
    pub error_servers: usize,
    /// Tools in the catalog
    pub total_tools: usize,
    /// Tools with merged classification
    pub classified_tools: usize,
}

/// Per-server diagnostics view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDiagnostics {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    pub consecutive_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub tool_count: usize,
    /// Whether a live session exists
    pub has_session: bool,
    pub message_count: u64,
    pub error_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// How a forwarded call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// The backend executed the tool
    Success,
    /// The backend reported a tool-level failure
    ToolError,
}

impl CallOutcome {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::ToolError => "tool_error",
        }
    }
}

/// Timing and outcome attached to every [`ToolCallResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMetadata {
    pub latency_ms: u64,
    pub outcome: CallOutcome,
}

/// Structured result of a routed tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Namespaced name of the invoked tool
    pub tool_name: String,
    pub server_id: String,
    pub server_name: String,
    /// Content items returned by the backend
    pub content: Vec<ToolResponseContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<serde_json::Value>,
    /// Whether the backend reported a tool failure
    pub is_error: bool,
    /// Backend message when `is_error` is set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub metadata: CallMetadata,
}

impl ToolCallResult {
    /// Concatenated text content.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolResponseContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
