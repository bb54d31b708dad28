//! In-process fake transport for unit tests
//!
//! [`FakeTransport::new`] returns a `(FakeTransport, FakeTransportHandle)`
//! pair. The transport goes into the code under test; the test keeps the
//! handle to read what the client sent and to inject what the "server" says.
//!
//! ```text
//! client send() -----> outbound_tx -----> outbound_rx (handle reads)
//! handle inbound_tx -----------------> inbound_rx  (client receive())
//! ```
//!
//! Dropping the handle closes both directions: `send` starts failing and the
//! `receive` stream ends, which is how tests simulate a backend that dies.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{mpsc, Mutex};

use crate::error::{AggregatorError, Result};
use crate::mcp::transport::Transport;

/// In-process fake transport for use in tests.
#[derive(Debug)]
pub struct FakeTransport {
    outbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    sent: AtomicUsize,
}

/// The test-side handle for a [`FakeTransport`].
#[derive(Debug)]
pub struct FakeTransportHandle {
    /// Receives messages that the client sent via [`Transport::send`].
    pub outbound_rx: mpsc::UnboundedReceiver<String>,
    /// Sends server messages into the client's [`Transport::receive`] stream.
    pub inbound_tx: mpsc::UnboundedSender<String>,
}

impl FakeTransport {
    /// Create a new `(FakeTransport, FakeTransportHandle)` pair.
    pub fn new() -> (Self, FakeTransportHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        let transport = Self {
            outbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            sent: AtomicUsize::new(0),
        };
        let handle = FakeTransportHandle {
            outbound_rx,
            inbound_tx,
        };
        (transport, handle)
    }

    /// Number of messages successfully sent through this transport.
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn send(&self, message: String) -> Result<()> {
        self.outbound_tx.send(message).map_err(|e| {
            AggregatorError::McpTransport(format!("fake transport closed: {e}"))
        })?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.inbound_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let item = rx.lock().await.recv().await?;
            Some((item, rx))
        }))
    }

    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        Box::pin(futures::stream::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_delivers_to_handle_in_order() {
        let (transport, mut handle) = FakeTransport::new();

        for i in 0u32..3 {
            transport.send(format!("msg-{i}")).await.unwrap();
        }
        for i in 0u32..3 {
            assert_eq!(handle.outbound_rx.recv().await.unwrap(), format!("msg-{i}"));
        }
        assert_eq!(transport.sent_count(), 3);
    }

    #[tokio::test]
    async fn test_receive_yields_injected_messages() {
        let (transport, handle) = FakeTransport::new();
        handle
            .inbound_tx
            .send(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_string())
            .unwrap();

        let mut stream = transport.receive();
        let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out")
            .expect("stream ended");
        assert_eq!(msg, r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
    }

    #[tokio::test]
    async fn test_dropping_handle_closes_both_directions() {
        let (transport, handle) = FakeTransport::new();
        drop(handle);

        assert!(transport.send("test".to_string()).await.is_err());
        let mut stream = transport.receive();
        assert!(stream.next().await.is_none());
    }
}
