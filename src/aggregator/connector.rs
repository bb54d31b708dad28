//! Connection settings and transport construction
//!
//! A server's `connection_config` is an opaque JSON object to the rest of the
//! aggregator. This module is the one place that interprets it: it validates
//! the settings at registration time and turns them into a live
//! [`Transport`] when a session is opened.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::aggregator::models::{ExternalServer, TransportKind};
use crate::error::{AggregatorError, Result};
use crate::mcp::transport::http::HttpTransport;
use crate::mcp::transport::sse::SseTransport;
use crate::mcp::transport::stdio::{StdioCommand, StdioTransport};
use crate::mcp::transport::Transport;

/// Typed view of a server's `connection_config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSettings {
    /// Launch a child process
    Stdio(StdioCommand),
    /// Reach a remote endpoint (sse or http)
    Remote {
        url: url::Url,
        headers: HashMap<String, String>,
    },
}

/// `connection_config` of a stdio server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StdioSettings {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default = "default_inherit_env")]
    inherit_env: bool,
}

fn default_inherit_env() -> bool {
    true
}

/// `connection_config` of an sse or http server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RemoteSettings {
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// Parse `config` for `kind`.
///
/// # Errors
///
/// Returns [`AggregatorError::Validation`] when a required field is missing,
/// a field has the wrong type or is unknown, or a URL is not http/https.
pub fn parse_connection_config(
    kind: TransportKind,
    config: &Value,
) -> std::result::Result<TransportSettings, AggregatorError> {
    if !config.is_object() {
        return Err(AggregatorError::Validation(format!(
            "{kind} connection config must be a JSON object"
        )));
    }
    let invalid = |e: serde_json::Error| {
        AggregatorError::Validation(format!("invalid {kind} connection config: {e}"))
    };

    match kind {
        TransportKind::Stdio => {
            let settings: StdioSettings = serde_json::from_value(config.clone()).map_err(invalid)?;
            if settings.command.trim().is_empty() {
                return Err(AggregatorError::Validation(
                    "stdio connection config requires a non-empty 'command'".into(),
                ));
            }
            Ok(TransportSettings::Stdio(StdioCommand {
                executable: PathBuf::from(settings.command),
                args: settings.args,
                env: settings.env,
                working_dir: settings.cwd,
                inherit_env: settings.inherit_env,
            }))
        }
        TransportKind::Sse | TransportKind::Http => {
            let settings: RemoteSettings = serde_json::from_value(config.clone()).map_err(invalid)?;
            let url = parse_http_url(&settings.url)?;
            Ok(TransportSettings::Remote {
                url,
                headers: settings.headers,
            })
        }
    }
}

/// Validate `config` for `kind` without keeping the parsed form.
pub fn validate_connection_config(
    kind: TransportKind,
    config: &Value,
) -> std::result::Result<(), AggregatorError> {
    parse_connection_config(kind, config).map(|_| ())
}

/// Parse `raw` as an absolute http or https URL.
pub fn parse_http_url(raw: &str) -> std::result::Result<url::Url, AggregatorError> {
    let url = url::Url::parse(raw)
        .map_err(|e| AggregatorError::Validation(format!("invalid URL '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(AggregatorError::Validation(format!(
            "URL '{raw}' must use http or https, not '{other}'"
        ))),
    }
}

/// Builds transports for servers. The session manager only ever talks to
/// this seam, so tests can swap in in-process backends.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport to `server`. The MCP handshake is not part of this.
    async fn open(&self, server: &ExternalServer) -> Result<Arc<dyn Transport>>;
}

/// Factory for the real stdio, sse and http transports.
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl DefaultTransportFactory {
    /// `connect_timeout` bounds opening an event stream; `request_timeout`
    /// bounds each HTTP request of the Streamable HTTP transport.
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

impl Default for DefaultTransportFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(60))
    }
}

#[async_trait::async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(&self, server: &ExternalServer) -> Result<Arc<dyn Transport>> {
        let settings = parse_connection_config(server.transport_kind, &server.connection_config)?;

        let transport: Arc<dyn Transport> = match (server.transport_kind, settings) {
            (TransportKind::Stdio, TransportSettings::Stdio(command)) => {
                tracing::debug!(server = %server.name, command = %command.executable.display(), "Spawning stdio server");
                Arc::new(StdioTransport::spawn(command)?)
            }
            (TransportKind::Sse, TransportSettings::Remote { url, headers }) => {
                tracing::debug!(server = %server.name, %url, "Opening SSE stream");
                Arc::new(SseTransport::connect(url, headers, self.connect_timeout).await?)
            }
            (TransportKind::Http, TransportSettings::Remote { url, headers }) => {
                tracing::debug!(server = %server.name, %url, "Using Streamable HTTP endpoint");
                Arc::new(HttpTransport::new(url, headers, self.request_timeout)?)
            }
            (kind, _) => {
                return Err(AggregatorError::Validation(format!(
                    "connection config does not match transport kind {kind}"
                ))
                .into())
            }
        };
        Ok(transport)
    }
}
