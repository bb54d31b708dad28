//! Tool discovery and the aggregated catalog
//!
//! [`ToolAggregator`] is the only writer of catalog rows. Discovery lists a
//! server's tools through its live session and reconciles the stored set:
//! upsert by `(server_id, original_name)`, prune what disappeared, update the
//! registry's tool count. New and changed tools are queued for
//! classification and stay routable while unclassified.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregator::classify::{index_metadata, ClassificationQueue, Classifier, ToolIndex};
use crate::aggregator::events::{AggregatorEvent, EventBus};
use crate::aggregator::models::{namespaced_name, AggregatedTool, ExternalServer, ToolClassification};
use crate::aggregator::registry::ServerRegistry;
use crate::aggregator::session::{ServerSession, SessionManager, SessionObserver};
use crate::aggregator::store::Store;
use crate::aggregator::sync::KeyedLocks;
use crate::error::{AggregatorError, Result};

/// Outcome of one discovery run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub total: usize,
}

/// Discovers, namespaces and stores backend tools.
pub struct ToolAggregator {
    store: Arc<dyn Store>,
    registry: ServerRegistry,
    sessions: Arc<SessionManager>,
    classifier: Arc<dyn Classifier>,
    index: Arc<dyn ToolIndex>,
    events: EventBus,
    locks: KeyedLocks,
    discovery_timeout: Duration,
    queue: ClassificationQueue,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl std::fmt::Debug for ToolAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolAggregator")
            .field("discovery_timeout", &self.discovery_timeout)
            .finish_non_exhaustive()
    }
}

impl ToolAggregator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        registry: ServerRegistry,
        sessions: Arc<SessionManager>,
        classifier: Arc<dyn Classifier>,
        index: Arc<dyn ToolIndex>,
        events: EventBus,
        discovery_timeout: Duration,
    ) -> Arc<Self> {
        let (queue, queue_rx) = ClassificationQueue::new();
        Arc::new(Self {
            store,
            registry,
            sessions,
            classifier,
            index,
            events,
            locks: KeyedLocks::new(),
            discovery_timeout,
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
        })
    }

    /// Re-discover the tools of a server with a live session.
    ///
    /// # Errors
    ///
    /// [`AggregatorError::SessionNotFound`] without a live session,
    /// [`AggregatorError::Timeout`] when listing exceeds the discovery
    /// timeout.
    pub async fn discover(&self, server_id: &str) -> Result<DiscoveryReport> {
        let session = self
            .sessions
            .get(server_id)
            .ok_or_else(|| AggregatorError::SessionNotFound(server_id.to_string()))?;
        let server = self.registry.require(server_id).await?;
        self.discover_with_session(&server, &session).await
    }

    /// Discovery against an explicit session, used while a connect is still
    /// in progress and the session is not yet published.
    pub async fn discover_with_session(
        &self,
        server: &ExternalServer,
        session: &ServerSession,
    ) -> Result<DiscoveryReport> {
        let _guard = self.locks.lock(&server.id).await;

        let timeout = self.discovery_timeout;
        let listed = match tokio::time::timeout(timeout, session.list_tools(timeout)).await {
            Ok(listed) => listed?,
            Err(_) => {
                return Err(AggregatorError::Timeout {
                    server: server.name.clone(),
                    operation: "discover".to_string(),
                    timeout,
                }
                .into())
            }
        };

        let existing: HashMap<String, AggregatedTool> = self
            .store
            .list_server_tools(&server.id)
            .await?
            .into_iter()
            .map(|t| (t.original_name.clone(), t))
            .collect();

        let now = Utc::now();
        let mut report = DiscoveryReport::default();
        let mut seen = HashSet::new();

        for tool in listed {
            if !seen.insert(tool.name.clone()) {
                tracing::warn!(server = %server.name, tool = %tool.name, "Duplicate tool name in listing; keeping the first");
                continue;
            }

            let candidate = AggregatedTool {
                id: Uuid::new_v4().to_string(),
                source_server_id: server.id.clone(),
                server_name: server.name.clone(),
                namespaced_name: namespaced_name(&server.name, &tool.name),
                original_name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
                is_classified: false,
                classification: None,
                discovered_at: now,
                updated_at: now,
            };

            let changed = match existing.get(&candidate.original_name) {
                None => {
                    report.added += 1;
                    true
                }
                Some(previous) if previous.discovery_differs(&candidate) => {
                    report.updated += 1;
                    true
                }
                Some(_) => false,
            };

            let stored = self.store.upsert_tool(&candidate).await?;
            if changed {
                if let Err(e) = self.index.upsert(&stored, None, index_metadata(&stored)).await {
                    tracing::warn!(tool = %stored.namespaced_name, "Index upsert failed: {e:#}");
                }
                if !self.queue.enqueue(&stored.id) {
                    tracing::debug!(tool = %stored.namespaced_name, "Classification worker not running");
                }
            }
        }

        for (name, stale) in &existing {
            if seen.contains(name) {
                continue;
            }
            self.store.delete_tool(&stale.id).await?;
            self.drop_from_index(&stale.id).await;
            report.removed += 1;
        }

        report.total = seen.len();
        self.registry.set_tool_count(&server.id, report.total).await?;

        tracing::info!(
            server = %server.name,
            server_id = %server.id,
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            total = report.total,
            "Tools discovered"
        );
        self.events.publish(AggregatorEvent::ToolsDiscovered {
            server_id: server.id.clone(),
            added: report.added,
            updated: report.updated,
            removed: report.removed,
            total: report.total,
        });
        Ok(report)
    }

    /// Delete every tool of `server_id` from the catalog and the index.
    pub async fn remove_server_tools(&self, server_id: &str) -> Result<usize> {
        let _guard = self.locks.lock(server_id).await;
        let tools = self.store.list_server_tools(server_id).await?;
        let removed = self.store.delete_server_tools(server_id).await?;
        for tool in &tools {
            self.drop_from_index(&tool.id).await;
        }
        self.locks.forget(server_id);
        tracing::debug!(server_id, removed, "Removed server tools");
        Ok(removed)
    }

    async fn drop_from_index(&self, tool_id: &str) {
        if let Err(e) = self.index.delete(tool_id).await {
            tracing::warn!(tool_id, "Index delete failed: {e:#}");
        }
    }

    /// Merge a classification into a tool. Returns `false` when the tool was
    /// pruned in the meantime.
    pub async fn apply_classification(
        &self,
        tool_id: &str,
        classification: ToolClassification,
    ) -> Result<bool> {
        if !self.store.merge_classification(tool_id, &classification).await? {
            tracing::debug!(tool_id, "Classified tool no longer exists");
            return Ok(false);
        }
        if let Some(tool) = self.store.get_tool(tool_id).await? {
            if let Err(e) = self.index.upsert(&tool, None, index_metadata(&tool)).await {
                tracing::warn!(tool = %tool.namespaced_name, "Index upsert failed: {e:#}");
            }
            self.events.publish(AggregatorEvent::ToolClassified {
                tool_id: tool.id.clone(),
                namespaced_name: tool.namespaced_name.clone(),
            });
        }
        Ok(true)
    }

    pub async fn list_tools(&self) -> Result<Vec<AggregatedTool>> {
        self.store.list_tools().await
    }

    pub async fn list_server_tools(&self, server_id: &str) -> Result<Vec<AggregatedTool>> {
        self.store.list_server_tools(server_id).await
    }

    /// Run the classification worker until `cancel` fires. Only the first
    /// call starts a worker; later calls return `None`.
    pub fn spawn_classification_worker(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let mut rx = self.queue_rx.lock().ok().and_then(|mut rx| rx.take())?;
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                let tool_id = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(id) => id,
                        None => break,
                    },
                };
                this.classify_one(&tool_id).await;
            }
            tracing::debug!("Classification worker stopped");
        }))
    }

    async fn classify_one(&self, tool_id: &str) {
        let tool = match self.store.get_tool(tool_id).await {
            Ok(Some(tool)) => tool,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(tool_id, "Failed to load tool for classification: {e:#}");
                return;
            }
        };
        match self.classifier.classify(&tool).await {
            Ok(Some(classification)) => {
                if let Err(e) = self.apply_classification(tool_id, classification).await {
                    tracing::warn!(tool = %tool.namespaced_name, "Failed to merge classification: {e:#}");
                }
            }
            Ok(None) => tracing::trace!(tool = %tool.namespaced_name, "Classifier skipped tool"),
            Err(e) => tracing::warn!(tool = %tool.namespaced_name, "Classification failed: {e:#}"),
        }
    }
}

#[async_trait::async_trait]
impl SessionObserver for ToolAggregator {
    async fn on_session_ready(&self, server: &ExternalServer, session: &Arc<ServerSession>) -> Result<()> {
        self.discover_with_session(server, session).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::backoff::BackoffConfig;
    use crate::aggregator::classify::{MockClassifier, MockToolIndex, NoopClassifier, NoopIndex};
    use crate::aggregator::models::{ServerRegistration, ServerStatus, TransportKind};
    use crate::aggregator::session::SessionConfig;
    use crate::aggregator::store::MemoryStore;
    use crate::test_utils::{FakeTransportFactory, MockBackend};
    use serde_json::json;
    use std::sync::Weak;

    struct Fixture {
        registry: ServerRegistry,
        factory: Arc<FakeTransportFactory>,
        sessions: Arc<SessionManager>,
        tools: Arc<ToolAggregator>,
    }

    fn fixture_with(classifier: Arc<dyn Classifier>, index: Arc<dyn ToolIndex>) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let events = EventBus::default();
        let registry = ServerRegistry::new(Arc::clone(&store), events.clone());
        let factory = Arc::new(FakeTransportFactory::new());
        let sessions = SessionManager::new(
            registry.clone(),
            factory.clone(),
            SessionConfig::default(),
            BackoffConfig::immediate(),
        );
        let tools = ToolAggregator::new(
            store,
            registry.clone(),
            Arc::clone(&sessions),
            classifier,
            index,
            events,
            Duration::from_secs(2),
        );
        let observer: Arc<dyn SessionObserver> = tools.clone();
        let weak: Weak<dyn SessionObserver> = Arc::downgrade(&observer);
        sessions.set_observer(weak);
        Fixture {
            registry,
            factory,
            sessions,
            tools,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(NoopClassifier), Arc::new(NoopIndex))
    }

    async fn connect(f: &Fixture, name: &str, backend: MockBackend) -> String {
        let server = f
            .registry
            .register(
                ServerRegistration::new(name, TransportKind::Http, json!({ "url": "http://fake.invalid/mcp" }))
                    .with_auto_connect(false),
            )
            .await
            .unwrap();
        f.factory.add_backend(name, backend);
        f.sessions.connect(&server.id).await.unwrap();
        server.id
    }

    #[tokio::test]
    async fn test_connect_discovers_namespaced_tools() {
        let f = fixture();
        let id = connect(&f, "gh", MockBackend::with_tools(&["list_repos", "create_issue", "search_code"])).await;

        let server = f.registry.require(&id).await.unwrap();
        assert_eq!(server.status, ServerStatus::Connected);
        assert_eq!(server.tool_count, 3);

        let names: Vec<String> = f
            .tools
            .list_server_tools(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.namespaced_name)
            .collect();
        assert_eq!(names, vec!["gh.create_issue", "gh.list_repos", "gh.search_code"]);
    }

    #[tokio::test]
    async fn test_rediscovery_prunes_and_adds_unclassified() {
        let f = fixture();
        let backend = MockBackend::with_tools(&["a", "b"]);
        let id = connect(&f, "gh", backend.clone()).await;
        let a_before = f.tools.list_server_tools(&id).await.unwrap()[0].clone();

        backend.set_tools(&["a", "c"]);
        let report = f.tools.discover(&id).await.unwrap();
        assert_eq!(
            report,
            DiscoveryReport {
                added: 1,
                updated: 0,
                removed: 1,
                total: 2
            }
        );

        let tools = f.tools.list_server_tools(&id).await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.original_name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(tools[0].id, a_before.id);
        assert_eq!(tools[0].discovered_at, a_before.discovered_at);
        assert!(!tools[1].is_classified);
        assert_eq!(f.registry.require(&id).await.unwrap().tool_count, 2);
    }

    #[tokio::test]
    async fn test_duplicate_names_keep_first() {
        let f = fixture();
        let id = connect(&f, "gh", MockBackend::with_tools(&["a", "a", "b"])).await;
        assert_eq!(f.tools.list_server_tools(&id).await.unwrap().len(), 2);
        assert_eq!(f.registry.require(&id).await.unwrap().tool_count, 2);
    }

    #[tokio::test]
    async fn test_discover_without_session_fails() {
        let f = fixture();
        let err = f.tools.discover("nope").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggregatorError>(),
            Some(AggregatorError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_server_tools_clears_catalog_and_index() {
        let mut index = MockToolIndex::new();
        index.expect_upsert().times(2).returning(|_, _, _| Ok(()));
        index.expect_delete().times(2).returning(|_| Ok(()));
        let f = fixture_with(Arc::new(NoopClassifier), Arc::new(index));
        let id = connect(&f, "gh", MockBackend::with_tools(&["a", "b"])).await;

        assert_eq!(f.tools.remove_server_tools(&id).await.unwrap(), 2);
        assert!(f.tools.list_tools().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_worker_merges_classification_without_touching_discovery_fields() {
        let mut classifier = MockClassifier::new();
        classifier.expect_classify().returning(|tool| {
            Ok(Some(ToolClassification {
                skill_ids: vec![format!("skill-{}", tool.original_name)],
                primary_skill: None,
                confidence: 0.5,
            }))
        });
        let f = fixture_with(Arc::new(classifier), Arc::new(NoopIndex));
        let mut events = f.tools.events.subscribe();
        let cancel = CancellationToken::new();
        let worker = f.tools.spawn_classification_worker(cancel.clone()).unwrap();
        assert!(f.tools.spawn_classification_worker(cancel.clone()).is_none());

        let id = connect(&f, "gh", MockBackend::with_tools(&["a"])).await;
        let before = f.tools.list_server_tools(&id).await.unwrap()[0].clone();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(AggregatorEvent::ToolClassified { .. }) = events.recv().await {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let after = f.tools.list_server_tools(&id).await.unwrap()[0].clone();
        assert!(after.is_classified);
        assert_eq!(after.classification.unwrap().skill_ids, vec!["skill-a"]);
        assert_eq!(after.description, before.description);
        assert_eq!(after.input_schema, before.input_schema);
        assert_eq!(after.namespaced_name, before.namespaced_name);

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_classification_of_pruned_tool_is_ignored() {
        let f = fixture();
        let applied = f
            .tools
            .apply_classification(
                "gone",
                ToolClassification {
                    skill_ids: vec![],
                    primary_skill: None,
                    confidence: 0.0,
                },
            )
            .await
            .unwrap();
        assert!(!applied);
    }
}
