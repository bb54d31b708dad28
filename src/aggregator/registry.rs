//! Server registry
//!
//! [`ServerRegistry`] is the single writer of [`ExternalServer`] records.
//! Every mutation of one server runs under that server's lock, so status,
//! failure counters and timestamps are updated by exactly one task at a time.

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;

use crate::aggregator::connector::{parse_http_url, validate_connection_config};
use crate::aggregator::events::{AggregatorEvent, EventBus};
use crate::aggregator::models::{ExternalServer, ServerRegistration, ServerStatus};
use crate::aggregator::store::Store;
use crate::aggregator::sync::KeyedLocks;
use crate::error::{AggregatorError, Result};

/// Longest accepted server name.
pub const MAX_SERVER_NAME_LEN: usize = 64;

fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").ok())
        .as_ref()
}

/// Check a server name. Names become tool namespaces, so they can never
/// contain the namespace separator.
pub fn validate_server_name(name: &str) -> std::result::Result<(), AggregatorError> {
    if name.is_empty() {
        return Err(AggregatorError::Validation("server name must not be empty".into()));
    }
    if name.len() > MAX_SERVER_NAME_LEN {
        return Err(AggregatorError::Validation(format!(
            "server name '{name}' is longer than {MAX_SERVER_NAME_LEN} characters"
        )));
    }
    let pattern = name_pattern()
        .ok_or_else(|| AggregatorError::Config("server name pattern failed to compile".into()))?;
    if !pattern.is_match(name) {
        return Err(AggregatorError::Validation(format!(
            "server name '{name}' may only contain letters, digits, '-' and '_' and must start with a letter or digit"
        )));
    }
    Ok(())
}

/// Registry of backend servers.
#[derive(Clone)]
pub struct ServerRegistry {
    store: Arc<dyn Store>,
    events: EventBus,
    id_locks: KeyedLocks,
    name_locks: KeyedLocks,
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry").finish_non_exhaustive()
    }
}

impl ServerRegistry {
    pub fn new(store: Arc<dyn Store>, events: EventBus) -> Self {
        Self {
            store,
            events,
            id_locks: KeyedLocks::new(),
            name_locks: KeyedLocks::new(),
        }
    }

    /// Register a new server in DISCONNECTED state.
    ///
    /// # Errors
    ///
    /// - [`AggregatorError::Validation`] for a bad name, connection config or
    ///   health URL
    /// - [`AggregatorError::DuplicateServer`] if the name is taken
    pub async fn register(&self, registration: ServerRegistration) -> Result<ExternalServer> {
        validate_server_name(&registration.name)?;
        validate_connection_config(registration.transport_kind, &registration.connection_config)?;
        if let Some(url) = &registration.health_check_url {
            parse_http_url(url)?;
        }

        let _name_guard = self.name_locks.lock(&registration.name).await;
        if self
            .store
            .find_server_by_name(&registration.name)
            .await?
            .is_some()
        {
            return Err(AggregatorError::DuplicateServer(registration.name).into());
        }

        let server = ExternalServer {
            id: uuid::Uuid::new_v4().to_string(),
            name: registration.name,
            transport_kind: registration.transport_kind,
            connection_config: registration.connection_config,
            status: ServerStatus::Disconnected,
            health_check_url: registration.health_check_url,
            consecutive_failures: 0,
            tool_count: 0,
            auto_connect: registration.auto_connect,
            last_error: None,
            registered_at: Utc::now(),
            connected_at: None,
            last_health_check: None,
        };
        self.store.insert_server(&server).await?;

        tracing::info!(server = %server.name, server_id = %server.id, transport = %server.transport_kind, "Registered server");
        self.events.publish(AggregatorEvent::ServerRegistered {
            server_id: server.id.clone(),
            name: server.name.clone(),
        });
        Ok(server)
    }

    /// Move a server to `status`.
    ///
    /// - CONNECTED resets `consecutive_failures`, stamps `connected_at` and
    ///   clears `last_error`.
    /// - DISCONNECTED clears `connected_at`.
    /// - ERROR records `error` as `last_error` and keeps the counter.
    pub async fn update_status(
        &self,
        id: &str,
        status: ServerStatus,
        error: Option<String>,
    ) -> Result<ExternalServer> {
        let _guard = self.id_locks.lock(id).await;
        let mut server = self.require(id).await?;
        let from = server.status;

        server.status = status;
        match status {
            ServerStatus::Connected => {
                server.consecutive_failures = 0;
                server.connected_at = Some(Utc::now());
                server.last_error = None;
            }
            ServerStatus::Disconnected => {
                server.connected_at = None;
            }
            ServerStatus::Error => {
                server.connected_at = None;
                if error.is_some() {
                    server.last_error = error;
                }
            }
            ServerStatus::Connecting => {}
        }
        self.store.update_server(&server).await?;

        if from != status {
            tracing::info!(server = %server.name, server_id = %server.id, %from, to = %status, "Server status changed");
            self.events.publish(AggregatorEvent::StatusChanged {
                server_id: server.id.clone(),
                name: server.name.clone(),
                from,
                to: status,
            });
        }
        Ok(server)
    }

    /// Reset the failure counter after a healthy probe.
    pub async fn record_probe_success(&self, id: &str) -> Result<ExternalServer> {
        let _guard = self.id_locks.lock(id).await;
        let mut server = self.require(id).await?;
        server.consecutive_failures = 0;
        server.last_health_check = Some(Utc::now());
        self.store.update_server(&server).await?;
        Ok(server)
    }

    /// Count a failed probe and return the updated record.
    pub async fn record_probe_failure(&self, id: &str, error: &str) -> Result<ExternalServer> {
        let _guard = self.id_locks.lock(id).await;
        let mut server = self.require(id).await?;
        server.consecutive_failures = server.consecutive_failures.saturating_add(1);
        server.last_health_check = Some(Utc::now());
        server.last_error = Some(error.to_string());
        self.store.update_server(&server).await?;
        Ok(server)
    }

    pub async fn set_tool_count(&self, id: &str, tool_count: usize) -> Result<()> {
        let _guard = self.id_locks.lock(id).await;
        let mut server = self.require(id).await?;
        if server.tool_count != tool_count {
            server.tool_count = tool_count;
            self.store.update_server(&server).await?;
        }
        Ok(())
    }

    /// All servers, optionally only those in `status`.
    pub async fn list(&self, status: Option<ServerStatus>) -> Result<Vec<ExternalServer>> {
        let servers = self.store.list_servers().await?;
        Ok(match status {
            Some(wanted) => servers.into_iter().filter(|s| s.status == wanted).collect(),
            None => servers,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<ExternalServer>> {
        self.store.get_server(id).await
    }

    /// Like [`get`](Self::get) but fails with `ServerNotFound`.
    pub async fn require(&self, id: &str) -> Result<ExternalServer> {
        self.store
            .get_server(id)
            .await?
            .ok_or_else(|| AggregatorError::ServerNotFound(id.to_string()).into())
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<ExternalServer>> {
        self.store.find_server_by_name(name).await
    }

    /// Delete the record. Sessions and tools must already be gone.
    pub async fn remove(&self, id: &str) -> Result<ExternalServer> {
        let server = {
            let _guard = self.id_locks.lock(id).await;
            let server = self.require(id).await?;
            self.store.delete_server(id).await?;
            server
        };
        self.id_locks.forget(id);

        tracing::info!(server = %server.name, server_id = %server.id, "Removed server");
        self.events.publish(AggregatorEvent::ServerRemoved {
            server_id: server.id.clone(),
            name: server.name.clone(),
        });
        Ok(server)
    }
}
