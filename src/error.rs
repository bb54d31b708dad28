//! Error types for toolmesh
//!
//! This module defines the error taxonomy shared by the aggregator core, the
//! MCP wire layer, and the CLI, using `thiserror` for ergonomic error
//! handling. Fallible functions return [`Result`], an `anyhow` alias, so
//! callers that need to branch on a specific failure use
//! `err.downcast_ref::<AggregatorError>()`.

use std::time::Duration;

use thiserror::Error;

use crate::aggregator::models::ServerStatus;

/// Main error type for toolmesh operations
///
/// Covers registration and validation failures, routing failures, MCP
/// transport and protocol failures, configuration, and storage.
#[derive(Error, Debug)]
pub enum AggregatorError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A server with the same name is already registered
    #[error("Server already registered: {0}")]
    DuplicateServer(String),

    /// Registration input failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// No server with the given id or name exists
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Establishing a session with a backend failed
    #[error("Connection to server '{server}' failed: {message}")]
    Connection {
        /// Name of the server
        server: String,
        /// Failure description
        message: String,
    },

    /// The target server exists but is not CONNECTED
    #[error("Server '{server}' is unavailable (status: {status})")]
    ServerUnavailable {
        /// Name of the server
        server: String,
        /// Status at the time of the call
        status: ServerStatus,
    },

    /// The server is CONNECTED but owns no live session
    #[error("No live session for server '{0}'")]
    SessionNotFound(String),

    /// No tool matches the requested name
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// An unnamespaced tool name matches tools on several servers
    #[error("Tool '{tool}' is ambiguous; provided by servers: {}", servers.join(", "))]
    AmbiguousTool {
        /// The requested tool name
        tool: String,
        /// Names of every server exposing it
        servers: Vec<String>,
    },

    /// A bounded operation against a backend exceeded its deadline
    #[error("Operation '{operation}' on server '{server}' timed out after {timeout:?}")]
    Timeout {
        /// Name of the server
        server: String,
        /// Operation that timed out
        operation: String,
        /// Deadline that was exceeded
        timeout: Duration,
    },

    /// The backend answered with a JSON-RPC error
    #[error("MCP error: {0}")]
    Mcp(String),

    /// The transport under an MCP session failed
    #[error("MCP transport error: {0}")]
    McpTransport(String),

    /// A JSON-RPC request received no response in time
    #[error("MCP timeout waiting for '{method}'")]
    McpTimeout {
        /// JSON-RPC method name
        method: String,
    },

    /// The backend negotiated a protocol revision we do not speak
    #[error("MCP protocol version mismatch: expected one of {expected:?}, got {got}")]
    McpProtocolVersion {
        /// Supported revisions
        expected: Vec<String>,
        /// Revision returned by the server
        got: String,
    },

    /// Catalog and registry storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for toolmesh operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

/// Returns the [`AggregatorError`] carried by `err`, if any.
pub fn as_aggregator_error(err: &anyhow::Error) -> Option<&AggregatorError> {
    err.downcast_ref::<AggregatorError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = AggregatorError::Config("invalid format".to_string());
        assert_eq!(error.to_string(), "Configuration error: invalid format");
    }

    #[test]
    fn test_duplicate_server_display() {
        let error = AggregatorError::DuplicateServer("gh".to_string());
        assert_eq!(error.to_string(), "Server already registered: gh");
    }

    #[test]
    fn test_ambiguous_tool_lists_servers() {
        let error = AggregatorError::AmbiguousTool {
            tool: "create_issue".to_string(),
            servers: vec!["gh".to_string(), "gh2".to_string()],
        };
        assert_eq!(
            error.to_string(),
            "Tool 'create_issue' is ambiguous; provided by servers: gh, gh2"
        );
    }

    #[test]
    fn test_server_unavailable_shows_status() {
        let error = AggregatorError::ServerUnavailable {
            server: "gh".to_string(),
            status: ServerStatus::Error,
        };
        assert_eq!(
            error.to_string(),
            "Server 'gh' is unavailable (status: ERROR)"
        );
    }

    #[test]
    fn test_timeout_display() {
        let error = AggregatorError::Timeout {
            server: "gh".to_string(),
            operation: "tools/call".to_string(),
            timeout: Duration::from_millis(1500),
        };
        let s = error.to_string();
        assert!(s.contains("tools/call"));
        assert!(s.contains("1.5s"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: AggregatorError = io_error.into();
        assert!(matches!(error, AggregatorError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{invalid json}").unwrap_err();
        let error: AggregatorError = json_error.into();
        assert!(matches!(error, AggregatorError::Serialization(_)));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: : yaml").unwrap_err();
        let error: AggregatorError = yaml_error.into();
        assert!(matches!(error, AggregatorError::Yaml(_)));
    }

    #[test]
    fn test_downcast_through_context() {
        let err: anyhow::Error = anyhow::Error::from(AggregatorError::ToolNotFound(
            "gh.create_issue".to_string(),
        ))
        .context("executing tool");
        assert!(matches!(
            as_aggregator_error(&err),
            Some(AggregatorError::ToolNotFound(name)) if name == "gh.create_issue"
        ));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AggregatorError>();
    }
}
