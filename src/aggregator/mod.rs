//! The aggregator core
//!
//! [`Aggregator`] owns and wires the components:
//!
//! - [`registry::ServerRegistry`]: durable server records and status
//! - [`session::SessionManager`]: one live MCP session per server
//! - [`discovery::ToolAggregator`]: the namespaced tool catalog
//! - [`router::RequestRouter`]: tool call resolution and forwarding
//! - [`health::HealthMonitor`]: probing and reconnection
//!
//! Build one with [`AggregatorBuilder`], call [`Aggregator::start`] to run
//! the background tasks and [`Aggregator::shutdown`] to stop them.

pub mod backoff;
pub mod classify;
pub mod connector;
pub mod discovery;
pub mod events;
pub mod health;
pub mod models;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;
pub mod sync;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

use self::backoff::BackoffConfig;
use self::classify::{Classifier, NoopClassifier, NoopIndex, ToolIndex};
use self::connector::{DefaultTransportFactory, TransportFactory};
use self::discovery::{DiscoveryReport, ToolAggregator};
use self::events::{AggregatorEvent, EventBus, DEFAULT_EVENT_CAPACITY};
use self::health::{HealthConfig, HealthMonitor};
use self::models::{
    AggregatedTool, AggregatorState, ExternalServer, ServerDiagnostics, ServerRegistration,
    ServerStatus, ToolCallResult,
};
use self::registry::ServerRegistry;
use self::router::{RequestRouter, RoutingContext};
use self::session::{SessionConfig, SessionManager, SessionObserver};
use self::store::{MemoryStore, Store};

/// Timeouts and policies of one aggregator instance.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub session: SessionConfig,
    /// Bound on one forwarded `tools/call`
    pub call_timeout: Duration,
    /// Bound on one discovery run
    pub discovery_timeout: Duration,
    pub health: HealthConfig,
    pub backoff: BackoffConfig,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            call_timeout: Duration::from_secs(60),
            discovery_timeout: Duration::from_secs(30),
            health: HealthConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl AggregatorSettings {
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            session: SessionConfig {
                connect_timeout: Duration::from_secs(2),
                ..SessionConfig::default()
            },
            call_timeout: Duration::from_secs(2),
            discovery_timeout: Duration::from_secs(2),
            health: HealthConfig::default(),
            backoff: BackoffConfig::immediate(),
        }
    }
}

/// Builder for [`Aggregator`].
///
/// Defaults: in-memory store, transports built from server records, no-op
/// classifier and index.
pub struct AggregatorBuilder {
    settings: AggregatorSettings,
    store: Option<Arc<dyn Store>>,
    factory: Option<Arc<dyn TransportFactory>>,
    classifier: Arc<dyn Classifier>,
    index: Arc<dyn ToolIndex>,
    event_capacity: usize,
}

impl Default for AggregatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregatorBuilder {
    pub fn new() -> Self {
        Self {
            settings: AggregatorSettings::default(),
            store: None,
            factory: None,
            classifier: Arc::new(NoopClassifier),
            index: Arc::new(NoopIndex),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn settings(mut self, settings: AggregatorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn index(mut self, index: Arc<dyn ToolIndex>) -> Self {
        self.index = index;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Aggregator {
        let settings = self.settings;
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(DefaultTransportFactory::new(
                settings.session.connect_timeout,
                settings.call_timeout,
            ))
        });
        let events = EventBus::new(self.event_capacity);

        let registry = ServerRegistry::new(Arc::clone(&store), events.clone());
        let sessions = SessionManager::new(
            registry.clone(),
            factory,
            settings.session.clone(),
            settings.backoff.clone(),
        );
        let tools = ToolAggregator::new(
            Arc::clone(&store),
            registry.clone(),
            Arc::clone(&sessions),
            self.classifier,
            self.index,
            events.clone(),
            settings.discovery_timeout,
        );
        let observer: Arc<dyn SessionObserver> = tools.clone();
        let weak: Weak<dyn SessionObserver> = Arc::downgrade(&observer);
        sessions.set_observer(weak);

        let router = RequestRouter::new(
            registry.clone(),
            Arc::clone(&sessions),
            Arc::clone(&store),
            settings.call_timeout,
        );
        let health = HealthMonitor::new(registry.clone(), Arc::clone(&sessions), settings.health.clone());

        Aggregator {
            settings,
            store,
            events,
            registry,
            sessions,
            tools,
            router,
            health,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// Gateway over many MCP servers.
pub struct Aggregator {
    settings: AggregatorSettings,
    store: Arc<dyn Store>,
    events: EventBus,
    registry: ServerRegistry,
    sessions: Arc<SessionManager>,
    tools: Arc<ToolAggregator>,
    router: RequestRouter,
    health: Arc<HealthMonitor>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("settings", &self.settings)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    pub fn builder() -> AggregatorBuilder {
        AggregatorBuilder::new()
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn tools(&self) -> &Arc<ToolAggregator> {
        &self.tools
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AggregatorEvent> {
        self.events.subscribe()
    }

    /// Register a server and, with `auto_connect`, connect it.
    ///
    /// A failed first connect does not fail registration; the server is left
    /// in ERROR for the health monitor to repair.
    pub async fn register_server(&self, registration: ServerRegistration) -> Result<ExternalServer> {
        let server = self.registry.register(registration).await?;
        if server.auto_connect {
            if let Err(e) = self.sessions.connect(&server.id).await {
                tracing::warn!(server = %server.name, "Initial connect failed: {e:#}");
            }
        }
        self.registry.require(&server.id).await
    }

    pub async fn connect_server(&self, server_id: &str) -> Result<ExternalServer> {
        self.sessions.connect(server_id).await?;
        self.registry.require(server_id).await
    }

    /// Backoff-gated reconnect; joins one already in flight.
    pub async fn reconnect_server(&self, server_id: &str) -> Result<ExternalServer> {
        self.sessions.reconnect(server_id).await?;
        self.registry.require(server_id).await
    }

    pub async fn disconnect_server(&self, server_id: &str) -> Result<ExternalServer> {
        self.registry.require(server_id).await?;
        self.sessions.close(server_id).await?;
        self.registry.require(server_id).await
    }

    /// Close the session, delete the tools, then delete the record.
    pub async fn remove_server(&self, server_id: &str) -> Result<ExternalServer> {
        let server = self.registry.require(server_id).await?;
        self.sessions.discard(server_id).await;
        self.tools.remove_server_tools(server_id).await?;
        let removed = self.registry.remove(server_id).await?;
        // A reconnect that raced the removal cannot find the record anymore,
        // but may have installed a session before it vanished.
        self.sessions.discard(server_id).await;
        tracing::info!(server = %server.name, server_id, "Server removed");
        Ok(removed)
    }

    pub async fn list_servers(&self, status: Option<ServerStatus>) -> Result<Vec<ExternalServer>> {
        self.registry.list(status).await
    }

    pub async fn get_server(&self, server_id: &str) -> Result<Option<ExternalServer>> {
        self.registry.get(server_id).await
    }

    pub async fn get_server_by_name(&self, name: &str) -> Result<Option<ExternalServer>> {
        self.registry.get_by_name(name).await
    }

    pub async fn list_tools(&self) -> Result<Vec<AggregatedTool>> {
        self.tools.list_tools().await
    }

    pub async fn list_server_tools(&self, server_id: &str) -> Result<Vec<AggregatedTool>> {
        self.tools.list_server_tools(server_id).await
    }

    pub async fn discover(&self, server_id: &str) -> Result<DiscoveryReport> {
        self.tools.discover(server_id).await
    }

    /// Counts by status and catalog totals, computed now.
    pub async fn state(&self) -> Result<AggregatorState> {
        let servers = self.registry.list(None).await?;
        let tools = self.store.list_tools().await?;
        let count = |status: ServerStatus| servers.iter().filter(|s| s.status == status).count();
        Ok(AggregatorState {
            total_servers: servers.len(),
            connected_servers: count(ServerStatus::Connected),
            connecting_servers: count(ServerStatus::Connecting),
            disconnected_servers: count(ServerStatus::Disconnected),
            error_servers: count(ServerStatus::Error),
            total_tools: tools.len(),
            classified_tools: tools.iter().filter(|t| t.is_classified).count(),
        })
    }

    pub async fn diagnostics(&self) -> Result<Vec<ServerDiagnostics>> {
        let servers = self.registry.list(None).await?;
        Ok(servers.iter().map(|s| self.diagnose(s)).collect())
    }

    pub async fn server_diagnostics(&self, server_id: &str) -> Result<ServerDiagnostics> {
        let server = self.registry.require(server_id).await?;
        Ok(self.diagnose(&server))
    }

    fn diagnose(&self, server: &ExternalServer) -> ServerDiagnostics {
        let stats = self.sessions.get(&server.id).map(|s| s.stats());
        ServerDiagnostics {
            id: server.id.clone(),
            name: server.name.clone(),
            status: server.status,
            consecutive_failures: server.consecutive_failures,
            last_health_check: server.last_health_check,
            last_error: server.last_error.clone(),
            tool_count: server.tool_count,
            has_session: stats.is_some(),
            message_count: stats.as_ref().map(|s| s.message_count).unwrap_or(0),
            error_count: stats.as_ref().map(|s| s.error_count).unwrap_or(0),
            last_activity: stats.map(|s| s.last_activity),
        }
    }

    pub async fn resolve(&self, tool_name: &str, server_id: Option<&str>) -> Result<RoutingContext> {
        self.router.resolve(tool_name, server_id).await
    }

    /// Invoke a tool by namespaced or unique unnamespaced name.
    pub async fn execute(&self, tool_name: &str, arguments: Option<Value>) -> Result<ToolCallResult> {
        self.router.execute(tool_name, arguments, None).await
    }

    /// Invoke a tool on an explicit server.
    pub async fn execute_on(
        &self,
        tool_name: &str,
        arguments: Option<Value>,
        server_id: &str,
    ) -> Result<ToolCallResult> {
        self.router.execute(tool_name, arguments, Some(server_id)).await
    }

    /// Invoke a tool on the first server in `server_ids` that can take it.
    pub async fn execute_prioritized(
        &self,
        tool_name: &str,
        arguments: Option<Value>,
        server_ids: &[String],
    ) -> Result<ToolCallResult> {
        self.router.execute_prioritized(tool_name, arguments, server_ids).await
    }

    /// Reconcile stored records after a restart: connect every
    /// `auto_connect` server, mark the others DISCONNECTED. Returns how many
    /// servers connected.
    pub async fn restore(&self) -> Result<usize> {
        let servers = self.registry.list(None).await?;
        let mut to_connect = Vec::new();
        for server in servers {
            if server.auto_connect {
                to_connect.push(server.id);
            } else if server.status != ServerStatus::Disconnected {
                self.registry
                    .update_status(&server.id, ServerStatus::Disconnected, None)
                    .await?;
            }
        }

        let outcomes = join_all(to_connect.iter().map(|id| self.sessions.connect(id))).await;
        let mut connected = 0;
        for (id, outcome) in to_connect.iter().zip(outcomes) {
            match outcome {
                Ok(()) => connected += 1,
                Err(e) => tracing::warn!(server_id = %id, "Restore connect failed: {e:#}"),
            }
        }
        tracing::info!(connected, attempted = to_connect.len(), "Restored servers");
        Ok(connected)
    }

    /// Start the health loop, the classification worker and the
    /// list-changed refresh loop. Calling it again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = Vec::new();
        if self.settings.health.enabled {
            tasks.push(self.health.spawn(self.cancel.child_token()));
        }
        if let Some(worker) = self.tools.spawn_classification_worker(self.cancel.child_token()) {
            tasks.push(worker);
        }
        if let Some(refresh) = self.spawn_refresh_loop() {
            tasks.push(refresh);
        }
        if let Ok(mut slot) = self.tasks.lock() {
            slot.extend(tasks);
        }
        tracing::info!("Aggregator started");
    }

    fn spawn_refresh_loop(&self) -> Option<JoinHandle<()>> {
        let mut rx = self.sessions.take_refresh_receiver()?;
        let tools = Arc::clone(&self.tools);
        let cancel = self.cancel.child_token();
        Some(tokio::spawn(async move {
            loop {
                let server_id = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(id) => id,
                        None => break,
                    },
                };
                tracing::debug!(server_id = %server_id, "Tool list changed; re-running discovery");
                if let Err(e) = tools.discover(&server_id).await {
                    tracing::warn!(server_id = %server_id, "Refresh discovery failed: {e:#}");
                }
            }
        }))
    }

    /// Stop background tasks and close every session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::debug!("Background task ended abnormally: {e}");
            }
        }
        self.sessions.shutdown().await;
        tracing::info!("Aggregator stopped");
    }
}
