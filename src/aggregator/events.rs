//! Aggregator event bus
//!
//! Components publish lifecycle events on a `tokio::sync::broadcast`
//! channel. Publishing never blocks and never fails: with no subscribers the
//! event is dropped, and slow subscribers observe `Lagged`.

use tokio::sync::broadcast;

use crate::aggregator::models::ServerStatus;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle events emitted by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorEvent {
    /// A server was registered
    ServerRegistered { server_id: String, name: String },

    /// A server and its tools were removed
    ServerRemoved { server_id: String, name: String },

    /// A server changed status
    StatusChanged {
        server_id: String,
        name: String,
        from: ServerStatus,
        to: ServerStatus,
    },

    /// Discovery reconciled a server's tools
    ToolsDiscovered {
        server_id: String,
        added: usize,
        updated: usize,
        removed: usize,
        total: usize,
    },

    /// A classification was merged into a tool
    ToolClassified { tool_id: String, namespaced_name: String },
}

impl AggregatorEvent {
    /// Short machine-readable name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServerRegistered { .. } => "server_registered",
            Self::ServerRemoved { .. } => "server_removed",
            Self::StatusChanged { .. } => "status_changed",
            Self::ToolsDiscovered { .. } => "tools_discovered",
            Self::ToolClassified { .. } => "tool_classified",
        }
    }
}

/// Broadcast bus for [`AggregatorEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AggregatorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; returns how many subscribers received it.
    pub fn publish(&self, event: AggregatorEvent) -> usize {
        tracing::trace!(event = event.event_type(), "Publishing aggregator event");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AggregatorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
