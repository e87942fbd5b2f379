//! In-memory queue broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nodelink_wire::{is_temporary_queue, now_millis, temporary_queue_name, Envelope};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{NetworkError, NetworkResult};

#[derive(Default)]
struct Queue {
    messages: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl Queue {
    fn messages(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pop the oldest message that has not expired, discarding expired ones.
    fn pop_live(&self, now_ms: u64) -> Option<Envelope> {
        let mut messages = self.messages();
        while let Some(message) = messages.pop_front() {
            if message.is_expired(now_ms) {
                debug!(destination = %message.destination, "Discarding expired message");
                continue;
            }
            return Some(message);
        }
        None
    }

    /// Drop expired messages at both ends of the queue.
    fn trim_expired(messages: &mut VecDeque<Envelope>, now_ms: u64) {
        while messages.front().is_some_and(|m| m.is_expired(now_ms)) {
            messages.pop_front();
        }
        while messages.back().is_some_and(|m| m.is_expired(now_ms)) {
            messages.pop_back();
        }
    }

    /// Drop every expired message, returning how many went.
    fn purge(&self, now_ms: u64) -> usize {
        let mut messages = self.messages();
        let before = messages.len();
        messages.retain(|m| !m.is_expired(now_ms));
        before - messages.len()
    }
}

/// Named FIFO queues with blocking receive and per-message expiry.
///
/// Queues are created on first use. Temporary queues must be created
/// explicitly; messages sent to a temporary queue that does not exist
/// (for instance a late reply after the requester gave up) are dropped.
///
/// Expired messages are trimmed whenever a queue is written to, and
/// [`purge_expired`](Self::purge_expired) clears queues nobody writes to
/// any more.
#[derive(Default)]
pub struct MessageBroker {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    temporary: Mutex<HashSet<String>>,
    deletion_watchers: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
    closed: AtomicBool,
}

impl MessageBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, Arc<Queue>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn temporary(&self) -> MutexGuard<'_, HashSet<String>> {
        self.temporary.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deletion_watchers(&self) -> MutexGuard<'_, HashMap<String, Vec<oneshot::Sender<()>>>> {
        self.deletion_watchers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> NetworkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectionClosed("broker shut down".into()));
        }
        Ok(())
    }

    fn queue(&self, name: &str) -> Arc<Queue> {
        Arc::clone(self.queues().entry(name.to_string()).or_default())
    }

    /// Look up a queue for consumption; temporary queues are never created implicitly.
    fn consumable_queue(&self, name: &str) -> NetworkResult<Arc<Queue>> {
        if is_temporary_queue(name) {
            return self
                .queues()
                .get(name)
                .cloned()
                .ok_or_else(|| NetworkError::Broker(format!("no such temporary queue: {}", name)));
        }
        Ok(self.queue(name))
    }

    /// Put a message on its destination queue.
    pub fn send(&self, message: Envelope) -> NetworkResult<()> {
        self.ensure_open()?;
        let now_ms = now_millis();
        if message.is_expired(now_ms) {
            debug!(destination = %message.destination, "Dropping message expired before delivery");
            return Ok(());
        }

        let queue = if is_temporary_queue(&message.destination) {
            match self.queues().get(&message.destination) {
                Some(queue) => Arc::clone(queue),
                None => {
                    debug!(destination = %message.destination, "Dropping message for deleted temporary queue");
                    return Ok(());
                }
            }
        } else {
            self.queue(&message.destination)
        };

        {
            let mut messages = queue.messages();
            Queue::trim_expired(&mut messages, now_ms);
            messages.push_back(message);
        }
        queue.notify.notify_one();
        Ok(())
    }

    /// Take the next live message from `queue`, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    pub async fn receive(&self, queue: &str, timeout: Duration) -> NetworkResult<Option<Envelope>> {
        self.ensure_open()?;
        let queue = self.consumable_queue(queue)?;
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(message) = queue.pop_live(now_millis()) {
                return Ok(Some(message));
            }
            // A notify_one issued before this point leaves a permit, so no wakeup is lost.
            if tokio::time::timeout_at(deadline, queue.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
            self.ensure_open()?;
        }
    }

    /// Create a uniquely named temporary queue.
    pub fn create_temporary_queue(&self) -> NetworkResult<String> {
        self.ensure_open()?;
        let name = temporary_queue_name();
        self.queues().insert(name.clone(), Arc::new(Queue::default()));
        self.temporary().insert(name.clone());
        Ok(name)
    }

    /// Delete a queue and its pending messages.
    pub fn delete_queue(&self, name: &str) {
        self.temporary().remove(name);
        if let Some(queue) = self.queues().remove(name) {
            queue.messages().clear();
            queue.notify.notify_waiters();
        }
        for watcher in self.deletion_watchers().remove(name).unwrap_or_default() {
            let _ = watcher.send(());
        }
    }

    /// Resolve once `name` is deleted.
    ///
    /// Returns `None` when no such queue exists. The receiver errors
    /// instead of resolving if the broker shuts down or is dropped first.
    pub fn watch_deletion(&self, name: &str) -> Option<oneshot::Receiver<()>> {
        // Held while registering so a concurrent delete cannot slip between.
        let queues = self.queues();
        if !queues.contains_key(name) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.deletion_watchers()
            .entry(name.to_string())
            .or_default()
            .push(tx);
        Some(rx)
    }

    /// Discard expired messages on every queue and forget idle named
    /// queues left empty. Returns the number of messages discarded.
    pub fn purge_expired(&self) -> usize {
        let now_ms = now_millis();
        let temporary = self.temporary().clone();
        let mut queues = self.queues();
        let mut discarded = 0;
        queues.retain(|name, queue| {
            discarded += queue.purge(now_ms);
            // A receiver holding the queue keeps it alive.
            temporary.contains(name) || Arc::strong_count(queue) > 1 || !queue.messages().is_empty()
        });
        if discarded > 0 {
            debug!(discarded, "Purged expired messages");
        }
        discarded
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` until the
    /// broker is shut down or dropped.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let broker = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(broker) = broker.upgrade() else { return };
                if broker.is_closed() {
                    return;
                }
                broker.purge_expired();
            }
        })
    }

    /// Number of messages waiting on `name`, counting expired ones not yet purged.
    pub fn queue_len(&self, name: &str) -> usize {
        self.queues()
            .get(name)
            .map(|q| q.messages().len())
            .unwrap_or(0)
    }

    /// Number of live temporary queues.
    pub fn temporary_queue_count(&self) -> usize {
        self.temporary().len()
    }

    /// Whether the broker has been shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse further operations and wake every waiting receiver.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for queue in self.queues().values() {
            queue.notify.notify_waiters();
        }
        self.deletion_watchers().clear();
    }

    /// Number of named and temporary queues the broker holds.
    pub fn queue_count(&self) -> usize {
        self.queues().len()
    }
}
