//! Seams to the external classifier and tool index
//!
//! Classification and embedding live outside the gateway. The catalog only
//! talks to them through [`Classifier`] and [`ToolIndex`]; the defaults do
//! nothing, so a bare gateway still routes every tool (unclassified).

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::aggregator::models::{AggregatedTool, ToolClassification};
use crate::error::Result;

/// Assigns skill categories to a tool.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Classifier: Send + Sync {
    /// `Ok(None)` means the classifier has no opinion; the tool stays
    /// unclassified.
    async fn classify(&self, tool: &AggregatedTool) -> Result<Option<ToolClassification>>;
}

/// Search index fed with catalog changes.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ToolIndex: Send + Sync {
    async fn upsert(
        &self,
        tool: &AggregatedTool,
        embedding: Option<Vec<f32>>,
        metadata: Value,
    ) -> Result<()>;

    async fn delete(&self, tool_id: &str) -> Result<()>;
}

/// Classifier that never classifies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopClassifier;

#[async_trait::async_trait]
impl Classifier for NoopClassifier {
    async fn classify(&self, _tool: &AggregatedTool) -> Result<Option<ToolClassification>> {
        Ok(None)
    }
}

/// Index that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndex;

#[async_trait::async_trait]
impl ToolIndex for NoopIndex {
    async fn upsert(&self, _tool: &AggregatedTool, _embedding: Option<Vec<f32>>, _metadata: Value) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _tool_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Metadata sent to the index alongside a tool.
pub fn index_metadata(tool: &AggregatedTool) -> Value {
    json!({
        "server_id": tool.source_server_id,
        "server_name": tool.server_name,
        "namespaced_name": tool.namespaced_name,
        "original_name": tool.original_name,
        "is_classified": tool.is_classified,
        "skill_ids": tool.classification.as_ref().map(|c| c.skill_ids.clone()).unwrap_or_default(),
        "primary_skill": tool.classification.as_ref().and_then(|c| c.primary_skill.clone()),
    })
}

/// Non-blocking queue of tool ids awaiting classification.
#[derive(Debug, Clone)]
pub struct ClassificationQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl ClassificationQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue `tool_id`. Returns `false` once the worker is gone.
    pub fn enqueue(&self, tool_id: &str) -> bool {
        self.tx.send(tool_id.to_string()).is_ok()
    }
}
