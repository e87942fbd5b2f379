//! Sessions on a message broker.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nodelink_wire::Envelope;

use super::queues::MessageBroker;
use crate::error::{NetworkError, NetworkResult};

/// A session able to send to and consume from broker queues.
///
/// Implemented in-process by [`LocalSession`] and over TCP by
/// [`BrokerLink`](super::BrokerLink).
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Put a message on its destination queue.
    async fn send(&self, message: Envelope) -> NetworkResult<()>;

    /// Take the next message from `queue`, waiting up to `timeout`.
    async fn receive(&self, queue: &str, timeout: Duration) -> NetworkResult<Option<Envelope>>;

    /// Create a temporary queue owned by this session.
    async fn create_temporary_queue(&self) -> NetworkResult<String>;

    /// Delete a queue.
    async fn delete_queue(&self, queue: &str) -> NetworkResult<()>;

    /// Close the session. Temporary queues it created are deleted.
    async fn close(&self);

    /// Whether the session was closed or its link failed.
    fn is_closed(&self) -> bool;
}

/// Session on a broker in the same process.
pub struct LocalSession {
    broker: Arc<MessageBroker>,
    temporary: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl LocalSession {
    /// Open a session on `broker`.
    pub fn new(broker: Arc<MessageBroker>) -> Self {
        Self {
            broker,
            temporary: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The broker this session talks to.
    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    fn ensure_open(&self) -> NetworkResult<()> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed("session closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageChannel for LocalSession {
    async fn send(&self, message: Envelope) -> NetworkResult<()> {
        self.ensure_open()?;
        self.broker.send(message)
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> NetworkResult<Option<Envelope>> {
        self.ensure_open()?;
        self.broker.receive(queue, timeout).await
    }

    async fn create_temporary_queue(&self) -> NetworkResult<String> {
        self.ensure_open()?;
        let name = self.broker.create_temporary_queue()?;
        self.temporary
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone());
        Ok(name)
    }

    async fn delete_queue(&self, queue: &str) -> NetworkResult<()> {
        self.temporary
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(queue);
        self.broker.delete_queue(queue);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let owned: Vec<String> = self
            .temporary
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for queue in owned {
            self.broker.delete_queue(&queue);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.broker.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_deletes_temporary_queues() {
        let broker = Arc::new(MessageBroker::new());
        let session = LocalSession::new(Arc::clone(&broker));

        session.create_temporary_queue().await.unwrap();
        session.create_temporary_queue().await.unwrap();
        assert_eq!(broker.temporary_queue_count(), 2);

        session.close().await;
        assert!(session.is_closed());
        assert_eq!(broker.temporary_queue_count(), 0);
        assert!(session.send(Envelope::new(None, "q")).await.is_err());
    }

    #[tokio::test]
    async fn test_sessions_share_queues() {
        let broker = Arc::new(MessageBroker::new());
        let a = LocalSession::new(Arc::clone(&broker));
        let b = LocalSession::new(Arc::clone(&broker));

        a.send(Envelope::new(None, "shared").with_body(b"hi".to_vec()))
            .await
            .unwrap();
        let got = b.receive("shared", Duration::from_millis(50)).await.unwrap();
        assert_eq!(got.unwrap().body, b"hi");
    }
}
