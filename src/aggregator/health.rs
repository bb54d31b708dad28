//! Health supervision
//!
//! One loop probes every CONNECTED server each interval, concurrently and
//! each under its own deadline. Consecutive failures are counted by the
//! registry; at the threshold the server goes to ERROR and a reconnect is
//! scheduled through the session manager. ERROR servers are revisited every
//! tick. A healthy probe never marks a server CONNECTED on its own; only a
//! completed reconnect does.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use metrics::increment_counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::models::{ExternalServer, ServerStatus};
use crate::aggregator::registry::ServerRegistry;
use crate::aggregator::session::SessionManager;

/// Health loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failures that move a server to ERROR
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            failure_threshold: 3,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub probed: usize,
    pub healthy: usize,
    pub failed: usize,
    pub reconnects_scheduled: usize,
}

/// Probes servers and repairs failed ones.
pub struct HealthMonitor {
    registry: ServerRegistry,
    sessions: Arc<SessionManager>,
    http: reqwest::Client,
    config: HealthConfig,
    reconnecting: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("pending_reconnects", &self.pending_reconnects())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    pub fn new(registry: ServerRegistry, sessions: Arc<SessionManager>, config: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            sessions,
            http: reqwest::Client::new(),
            config,
            reconnecting: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Reconnects scheduled by this monitor that have not finished yet.
    pub fn pending_reconnects(&self) -> usize {
        self.reconnecting.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Run one supervision pass.
    pub async fn tick(self: &Arc<Self>) -> TickReport {
        let mut report = TickReport::default();

        let connected = match self.registry.list(Some(ServerStatus::Connected)).await {
            Ok(servers) => servers,
            Err(e) => {
                tracing::warn!("Health tick could not list servers: {e:#}");
                return report;
            }
        };

        let probes = connected.iter().map(|server| async move {
            let outcome = self.probe(server).await;
            (server, outcome)
        });
        for (server, outcome) in join_all(probes).await {
            report.probed += 1;
            match outcome {
                Ok(()) => {
                    report.healthy += 1;
                    increment_counter!("toolmesh_health_probes_total", "server" => server.name.clone(), "result" => "healthy");
                    if let Err(e) = self.registry.record_probe_success(&server.id).await {
                        tracing::debug!(server = %server.name, "Could not record probe success: {e:#}");
                    }
                }
                Err(message) => {
                    report.failed += 1;
                    increment_counter!("toolmesh_health_probes_total", "server" => server.name.clone(), "result" => "failed");
                    if self.handle_failure(server, &message).await {
                        report.reconnects_scheduled += 1;
                    }
                }
            }
        }

        report.reconnects_scheduled += self.revisit_errored().await;

        tracing::debug!(
            probed = report.probed,
            healthy = report.healthy,
            failed = report.failed,
            reconnects = report.reconnects_scheduled,
            "Health tick complete"
        );
        report
    }

    /// Count a failed probe; at the threshold mark ERROR and schedule a
    /// reconnect. Returns whether one was scheduled.
    async fn handle_failure(self: &Arc<Self>, server: &ExternalServer, message: &str) -> bool {
        let updated = match self.registry.record_probe_failure(&server.id, message).await {
            Ok(updated) => updated,
            Err(e) => {
                tracing::debug!(server = %server.name, "Could not record probe failure: {e:#}");
                return false;
            }
        };
        tracing::warn!(
            server = %server.name,
            failures = updated.consecutive_failures,
            threshold = self.config.failure_threshold,
            error = message,
            "Health probe failed"
        );
        if updated.consecutive_failures < self.config.failure_threshold {
            return false;
        }
        if let Err(e) = self
            .registry
            .update_status(&server.id, ServerStatus::Error, Some(message.to_string()))
            .await
        {
            tracing::debug!(server = %server.name, "Could not mark server failed: {e:#}");
            return false;
        }
        self.schedule_reconnect(&server.id)
    }

    async fn revisit_errored(self: &Arc<Self>) -> usize {
        let errored = match self.registry.list(Some(ServerStatus::Error)).await {
            Ok(servers) => servers,
            Err(e) => {
                tracing::warn!("Health tick could not list failed servers: {e:#}");
                return 0;
            }
        };

        let candidates: Vec<ExternalServer> = errored
            .into_iter()
            .filter(|s| !self.is_reconnecting(&s.id) && !self.sessions.is_connecting(&s.id))
            .collect();
        let checks = candidates.iter().map(|server| async move {
            match &server.health_check_url {
                Some(url) => match self.probe_url(url).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!(server = %server.name, "Failed server still unhealthy: {e}");
                        false
                    }
                },
                None => true,
            }
        });
        let ready = join_all(checks).await;

        let mut scheduled = 0;
        for (server, ready) in candidates.iter().zip(ready) {
            if ready && self.schedule_reconnect(&server.id) {
                scheduled += 1;
            }
        }
        scheduled
    }

    fn is_reconnecting(&self, server_id: &str) -> bool {
        self.reconnecting
            .lock()
            .map(|r| r.contains(server_id))
            .unwrap_or(false)
    }

    /// Spawn one reconnect task for `server_id` unless one is pending.
    fn schedule_reconnect(self: &Arc<Self>, server_id: &str) -> bool {
        match self.reconnecting.lock() {
            Ok(mut pending) => {
                if !pending.insert(server_id.to_string()) {
                    return false;
                }
            }
            Err(_) => return false,
        }

        let sessions = Arc::clone(&self.sessions);
        let reconnecting = Arc::clone(&self.reconnecting);
        let id = server_id.to_string();
        tracing::info!(server_id, "Scheduling reconnect");
        tokio::spawn(async move {
            match sessions.reconnect(&id).await {
                Ok(()) => tracing::info!(server_id = %id, "Reconnect succeeded"),
                Err(e) => tracing::warn!(server_id = %id, "Reconnect failed: {e:#}"),
            }
            if let Ok(mut pending) = reconnecting.lock() {
                pending.remove(&id);
            }
        });
        true
    }

    async fn probe(&self, server: &ExternalServer) -> std::result::Result<(), String> {
        let timeout = self.config.probe_timeout;
        let check = async {
            match &server.health_check_url {
                Some(url) => self.probe_url(url).await,
                None => {
                    let session = self
                        .sessions
                        .get(&server.id)
                        .ok_or_else(|| "no live session".to_string())?;
                    session
                        .list_tools(timeout)
                        .await
                        .map(|_| ())
                        .map_err(|e| format!("{e:#}"))
                }
            }
        };
        match tokio::time::timeout(timeout, check).await {
            Ok(result) => result,
            Err(_) => Err(format!("health probe timed out after {timeout:?}")),
        }
    }

    async fn probe_url(&self, url: &str) -> std::result::Result<(), String> {
        let response = self
            .http
            .get(url)
            .timeout(self.config.probe_timeout)
            .send()
            .await
            .map_err(|e| format!("health check request failed: {e}"))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("health check returned HTTP {}", response.status()))
        }
    }

    /// Run [`tick`](Self::tick) every interval until `cancel` fires.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            tracing::info!(interval_secs = this.config.interval.as_secs_f64(), "Health monitor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        this.tick().await;
                    }
                }
            }
            tracing::info!("Health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::models::{ServerRegistration, TransportKind};
    use crate::aggregator::{Aggregator, AggregatorBuilder, AggregatorSettings};
    use crate::test_utils::{FakeTransportFactory, MockBackend};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn build(threshold: u32) -> (Aggregator, Arc<FakeTransportFactory>) {
        let factory = Arc::new(FakeTransportFactory::new());
        let mut settings = AggregatorSettings::for_tests();
        settings.health.failure_threshold = threshold;
        settings.health.probe_timeout = Duration::from_millis(200);
        let aggregator = AggregatorBuilder::new()
            .settings(settings)
            .transport_factory(factory.clone())
            .build();
        (aggregator, factory)
    }

    async fn health_endpoint(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    }

    async fn wait_until_settled(agg: &Aggregator) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while agg.health().pending_reconnects() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn status(agg: &Aggregator, id: &str) -> ServerStatus {
        agg.get_server(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_healthy_probes_keep_counter_at_zero() {
        let (agg, factory) = build(3);
        factory.add_backend("gh", MockBackend::with_tools(&["a"]));
        let id = agg
            .register_server(ServerRegistration::new("gh", TransportKind::Http, json!({ "url": "http://fake.invalid/mcp" })))
            .await
            .unwrap()
            .id;

        let report = agg.health().tick().await;
        assert_eq!(
            report,
            TickReport {
                probed: 1,
                healthy: 1,
                failed: 0,
                reconnects_scheduled: 0
            }
        );
        let server = agg.get_server(&id).await.unwrap().unwrap();
        assert_eq!(server.consecutive_failures, 0);
        assert!(server.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_threshold_moves_to_error_and_schedules_one_reconnect() {
        let endpoint = health_endpoint(503).await;
        let (agg, factory) = build(3);
        let backend = MockBackend::with_tools(&["a"]);
        factory.add_backend("gh", backend.clone());
        let id = agg
            .register_server(
                ServerRegistration::new("gh", TransportKind::Http, json!({ "url": "http://fake.invalid/mcp" }))
                    .with_health_check_url(format!("{}/health", endpoint.uri())),
            )
            .await
            .unwrap()
            .id;
        assert_eq!(factory.open_count("gh"), 1);

        for expected in 1..=2u32 {
            let report = agg.health().tick().await;
            assert_eq!(report.failed, 1);
            assert_eq!(report.reconnects_scheduled, 0);
            let server = agg.get_server(&id).await.unwrap().unwrap();
            assert_eq!(server.status, ServerStatus::Connected);
            assert_eq!(server.consecutive_failures, expected);
        }

        backend.set_handshake_delay(Duration::from_millis(200));
        let report = agg.health().tick().await;
        assert_eq!(report.reconnects_scheduled, 1);

        // A manual reconnect racing the scheduled one joins it.
        agg.reconnect_server(&id).await.unwrap();
        wait_until_settled(&agg).await;

        assert_eq!(factory.open_count("gh"), 2);
        let server = agg.get_server(&id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Connected);
        assert_eq!(server.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_dead_session_is_repaired_after_backend_returns() {
        let (agg, factory) = build(1);
        let backend = MockBackend::with_tools(&["a"]);
        factory.add_backend("gh", backend.clone());
        let id = agg
            .register_server(ServerRegistration::new("gh", TransportKind::Http, json!({ "url": "http://fake.invalid/mcp" })))
            .await
            .unwrap()
            .id;

        factory.refuse("gh", true);
        backend.go_dark();
        // The session manager demotes the server and tries once on its own.
        tokio::time::timeout(Duration::from_secs(2), async {
            while factory.open_count("gh") < 2 || agg.sessions().is_connecting(&id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(status(&agg, &id).await, ServerStatus::Error);

        let report = agg.health().tick().await;
        assert_eq!(report.probed, 0);
        assert_eq!(report.reconnects_scheduled, 1);
        wait_until_settled(&agg).await;
        assert_eq!(status(&agg, &id).await, ServerStatus::Error);

        factory.refuse("gh", false);
        let report = agg.health().tick().await;
        assert_eq!(report.probed, 0);
        assert_eq!(report.reconnects_scheduled, 1);
        wait_until_settled(&agg).await;
        assert_eq!(status(&agg, &id).await, ServerStatus::Connected);
    }

    #[tokio::test]
    async fn test_healthy_url_on_failed_server_only_triggers_reconnect() {
        let endpoint = health_endpoint(200).await;
        let (agg, factory) = build(3);
        factory.add_backend("gh", MockBackend::with_tools(&["a"]));
        factory.refuse("gh", true);
        let id = agg
            .register_server(
                ServerRegistration::new("gh", TransportKind::Http, json!({ "url": "http://fake.invalid/mcp" }))
                    .with_health_check_url(format!("{}/health", endpoint.uri())),
            )
            .await
            .unwrap()
            .id;
        assert_eq!(status(&agg, &id).await, ServerStatus::Error);

        let report = agg.health().tick().await;
        assert_eq!(report.probed, 0);
        assert_eq!(report.reconnects_scheduled, 1);
        wait_until_settled(&agg).await;

        assert_eq!(status(&agg, &id).await, ServerStatus::Error);
        assert_eq!(factory.open_count("gh"), 2);
    }

    #[tokio::test]
    async fn test_failed_servers_are_rechecked_concurrently() {
        let endpoint = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503).set_delay(Duration::from_millis(150)))
            .mount(&endpoint)
            .await;
        let (agg, factory) = build(3);
        for name in ["s1", "s2", "s3", "s4"] {
            factory.add_backend(name, MockBackend::with_tools(&["a"]));
            factory.refuse(name, true);
            agg.register_server(
                ServerRegistration::new(name, TransportKind::Http, json!({ "url": "http://fake.invalid/mcp" }))
                    .with_health_check_url(format!("{}/health", endpoint.uri())),
            )
            .await
            .unwrap();
        }

        let started = std::time::Instant::now();
        let report = agg.health().tick().await;
        let elapsed = started.elapsed();

        assert_eq!(report.reconnects_scheduled, 0);
        assert!(
            elapsed < Duration::from_millis(450),
            "four slow checks took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_cancel() {
        let (agg, _factory) = build(3);
        let cancel = CancellationToken::new();
        let handle = agg.health().spawn(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
