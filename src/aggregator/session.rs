//! Per-server MCP sessions
//!
//! [`SessionManager`] owns at most one live [`ServerSession`] per server id.
//! Connects and reconnects for one id are single-flight (concurrent callers
//! share one attempt) and run under that id's lock. Lock order is session
//! lock, then discovery lock, then registry lock; this module only ever takes
//! the first and calls into the others.
//!
//! A session becomes visible through [`SessionManager::get`] only after the
//! handshake succeeded and the [`SessionObserver`] (the tool aggregator) has
//! reconciled the catalog. Only then is the server marked CONNECTED.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::increment_counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::aggregator::backoff::{BackoffConfig, ExponentialBackoff};
use crate::aggregator::connector::TransportFactory;
use crate::aggregator::models::{ExternalServer, ServerStatus};
use crate::aggregator::registry::ServerRegistry;
use crate::aggregator::sync::{KeyedLocks, SingleFlight};
use crate::error::{as_aggregator_error, AggregatorError, Result};
use crate::mcp::client::BoxFuture;
use crate::mcp::protocol::{InitializedMcpProtocol, McpProtocol};
use crate::mcp::transport::{attach, Transport};
use crate::mcp::types::{
    CallToolResponse, ClientCapabilities, Implementation, McpTool, METHOD_PING,
    NOTIF_TOOLS_LIST_CHANGED,
};

/// Timeouts and identity used when opening sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on transport setup plus the MCP handshake
    pub connect_timeout: Duration,
    /// Name reported in `clientInfo`
    pub client_name: String,
    /// Version reported in `clientInfo`
    pub client_version: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Counters of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub error_count: u64,
}

/// A live, initialized MCP session with one backend.
pub struct ServerSession {
    server_id: String,
    server_name: String,
    protocol: InitializedMcpProtocol,
    _transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    message_count: AtomicU64,
    error_count: AtomicU64,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("server_id", &self.server_id)
            .field("server_name", &self.server_name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ServerSession {
    fn new(
        server: &ExternalServer,
        protocol: InitializedMcpProtocol,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Utc::now();
        Self {
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            protocol,
            _transport: transport,
            cancel,
            connected_at: now,
            last_activity: Mutex::new(now),
            message_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Identity the backend reported during the handshake.
    pub fn server_info(&self) -> &Implementation {
        self.protocol.server_info()
    }

    /// Whether the backend advertised `tools.listChanged`.
    pub fn supports_list_changed(&self) -> bool {
        self.protocol
            .initialize_response
            .capabilities
            .tools_list_changed()
    }

    /// `tools/list`, following pagination; `timeout` bounds each page.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<McpTool>> {
        let outcome = self.protocol.list_tools(Some(timeout)).await;
        self.track(outcome, "tools/list", timeout)
    }

    /// `tools/call` on the backend.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<CallToolResponse> {
        let outcome = self.protocol.call_tool(name, arguments, Some(timeout)).await;
        self.track(outcome, "tools/call", timeout)
    }

    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let outcome = self.protocol.ping(Some(timeout)).await;
        self.track(outcome, "ping", timeout)
    }

    /// Count the exchange and turn JSON-RPC deadlines into
    /// [`AggregatorError::Timeout`] naming this server.
    fn track<T>(&self, outcome: Result<T>, operation: &str, timeout: Duration) -> Result<T> {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Utc::now();
        }
        outcome.map_err(|e| {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            match as_aggregator_error(&e) {
                Some(AggregatorError::McpTimeout { .. }) => AggregatorError::Timeout {
                    server: self.server_name.clone(),
                    operation: operation.to_string(),
                    timeout,
                }
                .into(),
                _ => e,
            }
        })
    }

    /// Whether the transport has gone away or the session was closed.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the session's background tasks and release the transport.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            connected_at: self.connected_at,
            last_activity: self
                .last_activity
                .lock()
                .map(|t| *t)
                .unwrap_or(self.connected_at),
            message_count: self.message_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Hook run after a handshake and before the server becomes CONNECTED.
///
/// An error fails the connect attempt.
#[async_trait::async_trait]
pub trait SessionObserver: Send + Sync {
    async fn on_session_ready(
        &self,
        server: &ExternalServer,
        session: &Arc<ServerSession>,
    ) -> Result<()>;
}

type FlightResult = std::result::Result<(), Arc<anyhow::Error>>;

/// Owner of every live session.
pub struct SessionManager {
    registry: ServerRegistry,
    factory: Arc<dyn TransportFactory>,
    config: SessionConfig,
    sessions: RwLock<HashMap<String, Arc<ServerSession>>>,
    locks: KeyedLocks,
    flights: SingleFlight<FlightResult>,
    backoff: ExponentialBackoff,
    attempts: Mutex<HashMap<String, u32>>,
    observer: RwLock<Option<Weak<dyn SessionObserver>>>,
    refresh_tx: mpsc::UnboundedSender<String>,
    refresh_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

/// Rebuild a shared connect failure as an owned error, keeping the variants
/// callers branch on.
fn rebuild_error(e: &anyhow::Error) -> anyhow::Error {
    match as_aggregator_error(e) {
        Some(AggregatorError::ServerNotFound(id)) => AggregatorError::ServerNotFound(id.clone()).into(),
        Some(AggregatorError::Connection { server, message }) => AggregatorError::Connection {
            server: server.clone(),
            message: message.clone(),
        }
        .into(),
        Some(AggregatorError::Timeout {
            server,
            operation,
            timeout,
        }) => AggregatorError::Timeout {
            server: server.clone(),
            operation: operation.clone(),
            timeout: *timeout,
        }
        .into(),
        _ => anyhow::anyhow!("{e:#}"),
    }
}

impl SessionManager {
    pub fn new(
        registry: ServerRegistry,
        factory: Arc<dyn TransportFactory>,
        config: SessionConfig,
        backoff: BackoffConfig,
    ) -> Arc<Self> {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            registry,
            factory,
            config,
            sessions: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
            flights: SingleFlight::new(),
            backoff: ExponentialBackoff::new(backoff),
            attempts: Mutex::new(HashMap::new()),
            observer: RwLock::new(None),
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Install the session-ready hook. Held weakly so the observer may own
    /// this manager.
    pub fn set_observer(&self, observer: Weak<dyn SessionObserver>) {
        if let Ok(mut slot) = self.observer.write() {
            *slot = Some(observer);
        }
    }

    /// Take the queue of server ids whose backends announced
    /// `notifications/tools/list_changed`. Returns `None` after the first call.
    pub fn take_refresh_receiver(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.refresh_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// The live session for `server_id`, if any. Never blocks on I/O.
    pub fn get(&self, server_id: &str) -> Option<Arc<ServerSession>> {
        let sessions = self.sessions.read().ok()?;
        sessions
            .get(server_id)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Whether a connect or reconnect for `server_id` is running.
    pub fn is_connecting(&self, server_id: &str) -> bool {
        self.flights.is_in_flight(server_id)
    }

    /// Failed attempts since the last successful connect.
    pub fn failed_attempts(&self, server_id: &str) -> u32 {
        self.attempts
            .lock()
            .ok()
            .and_then(|a| a.get(server_id).copied())
            .unwrap_or(0)
    }

    /// Open a session for `server_id`, replacing any existing one.
    ///
    /// # Errors
    ///
    /// [`AggregatorError::ServerNotFound`] for an unknown id,
    /// [`AggregatorError::Connection`] or [`AggregatorError::Timeout`] when
    /// the backend cannot be reached; the server is then left in ERROR.
    pub async fn connect(self: &Arc<Self>, server_id: &str) -> Result<()> {
        self.run_flight(server_id, false).await
    }

    /// Close then connect, after the backoff delay for this server's failed
    /// attempt count. Joins an attempt already in flight for the same id.
    pub async fn reconnect(self: &Arc<Self>, server_id: &str) -> Result<()> {
        self.run_flight(server_id, true).await
    }

    async fn run_flight(self: &Arc<Self>, server_id: &str, backoff: bool) -> Result<()> {
        let this = Arc::clone(self);
        let id = server_id.to_string();
        self.flights
            .run(server_id, move || async move {
                this.connect_now(&id, backoff).await.map_err(Arc::new)
            })
            .await
            .unwrap_or_else(|| Err(Arc::new(anyhow::anyhow!("connect attempt for '{server_id}' was aborted"))))
            .map_err(|e| rebuild_error(&e))
    }

    async fn connect_now(self: &Arc<Self>, server_id: &str, backoff: bool) -> Result<()> {
        if backoff {
            let attempt = self.failed_attempts(server_id);
            let delay = self.backoff.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tracing::debug!(server_id, attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        return Err(anyhow::anyhow!("session manager is shutting down"));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        let _guard = self.locks.lock(server_id).await;
        let server = self.registry.require(server_id).await?;

        self.remove_session(server_id);
        self.registry
            .update_status(server_id, ServerStatus::Connecting, None)
            .await?;

        let outcome = self.establish(&server).await;
        let outcome = match outcome {
            Ok(session) => match self.notify_observer(&server, &session).await {
                Ok(()) => Ok(session),
                Err(e) => {
                    session.close();
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(session) => {
                if let Ok(mut sessions) = self.sessions.write() {
                    sessions.insert(server_id.to_string(), Arc::clone(&session));
                }
                self.watch_session(&session);
                self.registry
                    .update_status(server_id, ServerStatus::Connected, None)
                    .await?;
                if let Ok(mut attempts) = self.attempts.lock() {
                    attempts.remove(server_id);
                }
                if backoff {
                    increment_counter!("toolmesh_reconnects_total", "server" => server.name.clone(), "result" => "success");
                }
                tracing::info!(
                    server = %server.name,
                    server_id,
                    backend = %session.server_info().name,
                    "Session established"
                );
                Ok(())
            }
            Err(e) => {
                let message = format!("{e:#}");
                if let Ok(mut attempts) = self.attempts.lock() {
                    *attempts.entry(server_id.to_string()).or_insert(0) += 1;
                }
                if backoff {
                    increment_counter!("toolmesh_reconnects_total", "server" => server.name.clone(), "result" => "failure");
                }
                tracing::warn!(server = %server.name, server_id, error = %message, "Connect failed");
                self.registry
                    .update_status(server_id, ServerStatus::Error, Some(message.clone()))
                    .await?;

                let timed_out = matches!(as_aggregator_error(&e), Some(AggregatorError::Timeout { .. }));
                if timed_out {
                    Err(e)
                } else {
                    Err(AggregatorError::Connection {
                        server: server.name.clone(),
                        message,
                    }
                    .into())
                }
            }
        }
    }

    /// Demote a server whose session dies on its own (child exit, stream
    /// end) to ERROR and schedule a backoff-gated reconnect. Sessions ended
    /// through `close`, `discard` or a replacing connect are already gone
    /// from the table and are ignored.
    fn watch_session(self: &Arc<Self>, session: &Arc<ServerSession>) {
        let manager = Arc::downgrade(self);
        let weak_session = Arc::downgrade(session);
        let closed = session.cancel.clone();
        let server_id = session.server_id.clone();
        tokio::spawn(async move {
            closed.cancelled().await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if manager.shutdown.is_cancelled() {
                return;
            }
            if manager.forget_lost_session(&server_id, &weak_session).await {
                manager.handle_lost_session(&server_id).await;
            }
        });
    }

    /// Remove the session for `server_id` if it is still the one that died.
    async fn forget_lost_session(&self, server_id: &str, lost: &Weak<ServerSession>) -> bool {
        let _guard = self.locks.lock(server_id).await;
        let Ok(mut sessions) = self.sessions.write() else {
            return false;
        };
        let current = sessions
            .get(server_id)
            .map(|s| std::ptr::eq(Arc::as_ptr(s), lost.as_ptr()))
            .unwrap_or(false);
        if current {
            sessions.remove(server_id);
        }
        current
    }

    async fn handle_lost_session(self: &Arc<Self>, server_id: &str) {
        let message = "backend connection lost".to_string();
        tracing::warn!(server_id, "Session ended unexpectedly");
        match self.registry.get(server_id).await {
            Ok(Some(server)) if server.status == ServerStatus::Connected => {
                if let Err(e) = self
                    .registry
                    .update_status(server_id, ServerStatus::Error, Some(message))
                    .await
                {
                    tracing::debug!(server_id, "Could not mark server failed: {e:#}");
                    return;
                }
            }
            Ok(_) => return,
            Err(e) => {
                tracing::debug!(server_id, "Could not load server after session loss: {e:#}");
                return;
            }
        }
        if let Err(e) = self.reconnect(server_id).await {
            tracing::warn!(server_id, "Reconnect after session loss failed: {e:#}");
        }
    }

    async fn notify_observer(
        &self,
        server: &ExternalServer,
        session: &Arc<ServerSession>,
    ) -> Result<()> {
        let observer = self
            .observer
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(Weak::upgrade));
        match observer {
            Some(observer) => observer.on_session_ready(server, session).await,
            None => Ok(()),
        }
    }

    async fn establish(&self, server: &ExternalServer) -> Result<Arc<ServerSession>> {
        let cancel = self.shutdown.child_token();
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, self.handshake(server, cancel.clone())).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => {
                cancel.cancel();
                Err(e)
            }
            Err(_) => {
                cancel.cancel();
                Err(AggregatorError::Timeout {
                    server: server.name.clone(),
                    operation: "connect".to_string(),
                    timeout,
                }
                .into())
            }
        }
    }

    async fn handshake(
        &self,
        server: &ExternalServer,
        cancel: CancellationToken,
    ) -> Result<Arc<ServerSession>> {
        let transport = self.factory.open(server).await?;
        let client = attach(Arc::clone(&transport), cancel.clone(), &server.name);

        client.on_server_request(METHOD_PING, |_params| -> BoxFuture<'static, serde_json::Value> {
            Box::pin(async { serde_json::json!({}) })
        });
        let refresh_tx = self.refresh_tx.clone();
        let server_id = server.id.clone();
        client.on_notification(NOTIF_TOOLS_LIST_CHANGED, move |_params| {
            let _ = refresh_tx.send(server_id.clone());
        });

        let protocol = McpProtocol::new(client)
            .initialize(
                Implementation {
                    name: self.config.client_name.clone(),
                    version: self.config.client_version.clone(),
                    description: None,
                },
                ClientCapabilities::default(),
                Some(self.config.connect_timeout),
            )
            .await?;

        Ok(Arc::new(ServerSession::new(server, protocol, transport, cancel)))
    }

    fn remove_session(&self, server_id: &str) -> Option<Arc<ServerSession>> {
        let removed = self
            .sessions
            .write()
            .ok()
            .and_then(|mut sessions| sessions.remove(server_id));
        if let Some(session) = &removed {
            session.close();
        }
        removed
    }

    /// Close the session for `server_id` and mark it DISCONNECTED.
    /// Idempotent; unknown ids are a no-op.
    pub async fn close(&self, server_id: &str) -> Result<()> {
        let _guard = self.locks.lock(server_id).await;
        let had_session = self.remove_session(server_id).is_some();
        if let Some(server) = self.registry.get(server_id).await? {
            if server.status != ServerStatus::Disconnected {
                self.registry
                    .update_status(server_id, ServerStatus::Disconnected, None)
                    .await?;
            }
            if had_session {
                tracing::info!(server = %server.name, server_id, "Session closed");
            }
        }
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.remove(server_id);
        }
        Ok(())
    }

    /// Drop the session of a server that is being removed, without touching
    /// its record.
    pub async fn discard(&self, server_id: &str) {
        let _guard = self.locks.lock(server_id).await;
        self.remove_session(server_id);
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.remove(server_id);
        }
    }

    /// Stop pending reconnects and close every session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<String> = self
            .sessions
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                tracing::warn!(server_id = %id, "Failed to close session during shutdown: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::events::EventBus;
    use crate::aggregator::models::{ServerRegistration, TransportKind};
    use crate::aggregator::store::MemoryStore;
    use crate::test_utils::{FakeTransportFactory, MockBackend};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        registry: ServerRegistry,
        factory: Arc<FakeTransportFactory>,
        sessions: Arc<SessionManager>,
    }

    fn fixture(connect_timeout: Duration) -> Fixture {
        let registry = ServerRegistry::new(Arc::new(MemoryStore::new()), EventBus::default());
        let factory = Arc::new(FakeTransportFactory::new());
        let sessions = SessionManager::new(
            registry.clone(),
            factory.clone(),
            SessionConfig {
                connect_timeout,
                ..SessionConfig::default()
            },
            BackoffConfig::immediate(),
        );
        Fixture {
            registry,
            factory,
            sessions,
        }
    }

    async fn register(f: &Fixture, name: &str, backend: MockBackend) -> String {
        let server = f
            .registry
            .register(
                ServerRegistration::new(name, TransportKind::Http, json!({ "url": "http://fake.invalid/mcp" }))
                    .with_auto_connect(false),
            )
            .await
            .unwrap();
        f.factory.add_backend(name, backend);
        server.id
    }

    #[tokio::test]
    async fn test_connect_marks_connected_and_exposes_session() {
        let f = fixture(Duration::from_secs(2));
        let id = register(&f, "gh", MockBackend::with_tools(&["list_repos"])).await;

        f.sessions.connect(&id).await.unwrap();

        let server = f.registry.require(&id).await.unwrap();
        assert_eq!(server.status, ServerStatus::Connected);
        let session = f.sessions.get(&id).expect("session installed");
        let tools = session.list_tools(Duration::from_secs(1)).await.unwrap();
        assert_eq!(tools[0].name, "list_repos");
        assert_eq!(session.stats().message_count, 1);
    }

    #[tokio::test]
    async fn test_ping_counts_as_activity() {
        let f = fixture(Duration::from_secs(2));
        let id = register(&f, "gh", MockBackend::with_tools(&["a"])).await;
        f.sessions.connect(&id).await.unwrap();

        let session = f.sessions.get(&id).unwrap();
        session.ping(Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.stats().message_count, 1);
        assert_eq!(session.stats().error_count, 0);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_error_and_no_session() {
        let f = fixture(Duration::from_secs(2));
        let id = register(&f, "gh", MockBackend::with_tools(&["a"])).await;
        f.factory.refuse("gh", true);

        let err = f.sessions.connect(&id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggregatorError>(),
            Some(AggregatorError::Connection { .. })
        ));
        let server = f.registry.require(&id).await.unwrap();
        assert_eq!(server.status, ServerStatus::Error);
        assert!(server.last_error.is_some());
        assert!(f.sessions.get(&id).is_none());
        assert_eq!(f.sessions.failed_attempts(&id), 1);
    }

    #[tokio::test]
    async fn test_handshake_timeout_is_reported() {
        let f = fixture(Duration::from_millis(100));
        let id = register(&f, "slow", MockBackend::silent()).await;

        let err = f.sessions.connect(&id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggregatorError>(),
            Some(AggregatorError::Timeout { .. })
        ));
        assert_eq!(
            f.registry.require(&id).await.unwrap().status,
            ServerStatus::Error
        );
    }

    #[tokio::test]
    async fn test_unknown_server_is_not_found() {
        let f = fixture(Duration::from_secs(1));
        let err = f.sessions.connect("missing").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggregatorError>(),
            Some(AggregatorError::ServerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let f = fixture(Duration::from_secs(2));
        let id = register(&f, "gh", MockBackend::with_tools(&["a"]).with_handshake_delay(Duration::from_millis(100))).await;

        let mut handles = Vec::new();
        for i in 0..4 {
            let sessions = Arc::clone(&f.sessions);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    sessions.connect(&id).await
                } else {
                    sessions.reconnect(&id).await
                }
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(f.factory.open_count("gh"), 1);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session_and_resets_attempts() {
        let f = fixture(Duration::from_secs(2));
        let id = register(&f, "gh", MockBackend::with_tools(&["a"])).await;
        f.sessions.connect(&id).await.unwrap();
        let first = f.sessions.get(&id).unwrap();

        f.factory.refuse("gh", true);
        assert!(f.sessions.reconnect(&id).await.is_err());
        assert!(first.is_closed());
        assert_eq!(f.sessions.failed_attempts(&id), 1);

        f.factory.refuse("gh", false);
        f.sessions.reconnect(&id).await.unwrap();
        assert_eq!(f.sessions.failed_attempts(&id), 0);
        assert!(!f.sessions.get(&id).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let f = fixture(Duration::from_secs(2));
        let id = register(&f, "gh", MockBackend::with_tools(&["a"])).await;
        f.sessions.connect(&id).await.unwrap();

        f.sessions.close(&id).await.unwrap();
        f.sessions.close(&id).await.unwrap();
        f.sessions.close("never-registered").await.unwrap();

        assert!(f.sessions.get(&id).is_none());
        assert_eq!(
            f.registry.require(&id).await.unwrap().status,
            ServerStatus::Disconnected
        );
    }

    struct CountingObserver {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl SessionObserver for CountingObserver {
        async fn on_session_ready(&self, server: &ExternalServer, _session: &Arc<ServerSession>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Not yet routable while the hook runs.
            assert_ne!(server.status, ServerStatus::Connected);
            if self.fail {
                anyhow::bail!("discovery failed");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_observer_runs_before_connected_and_can_fail_connect() {
        let f = fixture(Duration::from_secs(2));
        let id = register(&f, "gh", MockBackend::with_tools(&["a"])).await;

        let observer = Arc::new(CountingObserver {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let weak: Weak<dyn SessionObserver> = Arc::downgrade(&(observer.clone() as Arc<dyn SessionObserver>));
        f.sessions.set_observer(weak);

        assert!(f.sessions.connect(&id).await.is_err());
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
        assert!(f.sessions.get(&id).is_none());
        assert_eq!(
            f.registry.require(&id).await.unwrap().status,
            ServerStatus::Error
        );
    }

    #[tokio::test]
    async fn test_list_changed_notification_feeds_refresh_queue() {
        let f = fixture(Duration::from_secs(2));
        let backend = MockBackend::with_tools(&["a"]);
        let id = register(&f, "gh", backend.clone()).await;
        let mut refresh = f.sessions.take_refresh_receiver().unwrap();
        assert!(f.sessions.take_refresh_receiver().is_none());

        f.sessions.connect(&id).await.unwrap();
        backend.announce_list_changed();

        let got = tokio::time::timeout(Duration::from_secs(1), refresh.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, id);
    }

    #[tokio::test]
    async fn test_backend_going_away_closes_session_and_reconnects() {
        let f = fixture(Duration::from_secs(2));
        let backend = MockBackend::with_tools(&["a"]);
        let id = register(&f, "gh", backend.clone()).await;
        f.sessions.connect(&id).await.unwrap();
        let session = f.sessions.get(&id).unwrap();

        backend.go_dark();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.factory.open_count("gh") < 2 || f.sessions.get(&id).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("lost session is replaced");
        assert!(!Arc::ptr_eq(&session, &f.sessions.get(&id).unwrap()));
        assert_eq!(
            f.registry.require(&id).await.unwrap().status,
            ServerStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_lost_session_with_unreachable_backend_leaves_error() {
        let f = fixture(Duration::from_secs(2));
        let backend = MockBackend::with_tools(&["a"]);
        let id = register(&f, "gh", backend.clone()).await;
        f.sessions.connect(&id).await.unwrap();

        f.factory.refuse("gh", true);
        backend.go_dark();

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.factory.open_count("gh") < 2 || f.sessions.is_connecting(&id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reconnect attempted");
        let server = f.registry.require(&id).await.unwrap();
        assert_eq!(server.status, ServerStatus::Error);
        assert!(server.last_error.is_some());
        assert!(f.sessions.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_closed_session_is_not_treated_as_lost() {
        let f = fixture(Duration::from_secs(2));
        let id = register(&f, "gh", MockBackend::with_tools(&["a"])).await;
        f.sessions.connect(&id).await.unwrap();

        f.sessions.close(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(f.factory.open_count("gh"), 1);
        assert_eq!(
            f.registry.require(&id).await.unwrap().status,
            ServerStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_cancelled_connect_still_completes() {
        let f = fixture(Duration::from_secs(2));
        let id = register(
            &f,
            "slow",
            MockBackend::with_tools(&["a"]).with_handshake_delay(Duration::from_millis(300)),
        )
        .await;

        let abandoned = tokio::time::timeout(Duration::from_millis(50), f.sessions.connect(&id)).await;
        assert!(abandoned.is_err());

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.sessions.is_connecting(&id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("attempt finishes without a waiting caller");
        assert_eq!(
            f.registry.require(&id).await.unwrap().status,
            ServerStatus::Connected
        );

        tokio::time::timeout(Duration::from_secs(1), f.sessions.close(&id))
            .await
            .expect("per-server lock released")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), f.sessions.discard(&id))
            .await
            .expect("per-server lock released");
    }
}
