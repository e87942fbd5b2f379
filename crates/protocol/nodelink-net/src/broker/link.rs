//! Client side of a TCP broker link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use nodelink_wire::Envelope;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::channel::MessageChannel;
use crate::codec::{read_frame, write_frame, BrokerFrame};
use crate::error::{NetworkError, NetworkResult};

/// How long the broker may take to answer a non-blocking operation.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Pending broker operations keyed by correlation id.
type PendingRequests = HashMap<u64, oneshot::Sender<BrokerFrame>>;

struct LinkState {
    pending: Mutex<PendingRequests>,
    closed: AtomicBool,
    closed_locally: AtomicBool,
    failure: Mutex<Option<String>>,
    broken_tx: Mutex<Option<oneshot::Sender<String>>>,
}

impl LinkState {
    fn pending(&self) -> MutexGuard<'_, PendingRequests> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> NetworkError {
        if self.closed_locally.load(Ordering::SeqCst) {
            return NetworkError::ConnectionClosed("broker link closed".into());
        }
        let reason = self
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "broker link failed".into());
        NetworkError::ConnectionBroken(reason)
    }

    /// Mark the link dead and fail every pending operation.
    ///
    /// The broken notification fires at most once, and only when the
    /// link was not closed locally.
    fn fail(&self, reason: String) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.clone());

        // Dropping the senders wakes every waiter with an error.
        self.pending().clear();

        let broken_tx = self.broken_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = broken_tx {
            if !self.closed_locally.load(Ordering::SeqCst) {
                let _ = tx.send(reason);
            }
        }
    }
}

/// A TCP session with a remote [`BrokerServer`](super::BrokerServer).
///
/// Operations are multiplexed over one stream: each request frame carries a
/// correlation id and a reader task routes replies to the waiting caller.
pub struct BrokerLink {
    peer: String,
    next_id: AtomicU64,
    state: Arc<LinkState>,
    outgoing: mpsc::Sender<BrokerFrame>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerLink {
    /// Open a link to the broker at `addr`.
    ///
    /// The returned receiver yields a reason once if the link later fails
    /// without having been closed locally.
    pub async fn connect(
        addr: &str,
        max_frame_size: usize,
    ) -> NetworkResult<(Arc<Self>, oneshot::Receiver<String>)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::ConnectFailed(format!("{}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (broken_tx, broken_rx) = oneshot::channel();
        let state = Arc::new(LinkState {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            closed_locally: AtomicBool::new(false),
            failure: Mutex::new(None),
            broken_tx: Mutex::new(Some(broken_tx)),
        });
        let (outgoing, outgoing_rx) = mpsc::channel(256);

        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&state), max_frame_size));
        let writer = tokio::spawn(write_loop(
            write_half,
            outgoing_rx,
            Arc::clone(&state),
            max_frame_size,
        ));

        debug!(peer = %addr, "Broker link established");

        let link = Arc::new(Self {
            peer: addr.to_string(),
            next_id: AtomicU64::new(1),
            state,
            outgoing,
            tasks: Mutex::new(vec![reader, writer]),
        });
        Ok((link, broken_rx))
    }

    /// Address of the broker.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Number of operations waiting for a broker reply.
    pub fn pending_len(&self) -> usize {
        self.state.pending().len()
    }

    /// Close the link. Pending operations fail with `ConnectionClosed`.
    pub fn shutdown(&self) {
        self.state.closed_locally.store(true, Ordering::SeqCst);
        self.state.fail("closed locally".into());
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }

    async fn call(
        &self,
        frame_for: impl FnOnce(u64) -> BrokerFrame,
        wait: Duration,
    ) -> NetworkResult<BrokerFrame> {
        if self.state.is_closed() {
            return Err(self.state.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.state.pending().insert(id, tx);

        // The link may have failed between the check and the insert.
        if self.state.is_closed() {
            self.state.pending().remove(&id);
            return Err(self.state.closed_error());
        }

        if self.outgoing.send(frame_for(id)).await.is_err() {
            self.state.pending().remove(&id);
            return Err(self.state.closed_error());
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(BrokerFrame::Error { message, .. })) => Err(NetworkError::Broker(message)),
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(self.state.closed_error()),
            Err(_) => {
                self.state.pending().remove(&id);
                Err(NetworkError::Timeout(format!(
                    "broker at {} did not answer within {:?}",
                    self.peer, wait
                )))
            }
        }
    }
}

impl Drop for BrokerLink {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }
}

fn unexpected(frame: BrokerFrame) -> NetworkError {
    NetworkError::ProtocolViolation(format!("unexpected broker reply: {:?}", frame))
}

#[async_trait]
impl MessageChannel for BrokerLink {
    async fn send(&self, message: Envelope) -> NetworkResult<()> {
        match self
            .call(|id| BrokerFrame::Send { id, message }, OPERATION_TIMEOUT)
            .await?
        {
            BrokerFrame::Ack { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> NetworkResult<Option<Envelope>> {
        let frame = self
            .call(
                |id| BrokerFrame::Receive {
                    id,
                    queue: queue.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                },
                timeout + OPERATION_TIMEOUT,
            )
            .await?;
        match frame {
            BrokerFrame::Delivered { message, .. } => Ok(message),
            other => Err(unexpected(other)),
        }
    }

    async fn create_temporary_queue(&self) -> NetworkResult<String> {
        match self
            .call(|id| BrokerFrame::CreateTemporaryQueue { id }, OPERATION_TIMEOUT)
            .await?
        {
            BrokerFrame::QueueCreated { queue, .. } => Ok(queue),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_queue(&self, queue: &str) -> NetworkResult<()> {
        let queue = queue.to_string();
        match self
            .call(|id| BrokerFrame::DeleteQueue { id, queue }, OPERATION_TIMEOUT)
            .await?
        {
            BrokerFrame::Ack { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn close(&self) {
        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

async fn read_loop(mut reader: OwnedReadHalf, state: Arc<LinkState>, max_frame_size: usize) {
    loop {
        match read_frame(&mut reader, max_frame_size).await {
            Ok(frame) => {
                let waiter = state.pending().remove(&frame.id());
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => debug!(id = frame.id(), "Broker reply for unknown or abandoned operation"),
                }
            }
            Err(e) => {
                if !state.is_closed() {
                    warn!(error = %e, "Broker link read failed");
                }
                state.fail(format!("read failed: {}", e));
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::Receiver<BrokerFrame>,
    state: Arc<LinkState>,
    max_frame_size: usize,
) {
    while let Some(frame) = outgoing.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame, max_frame_size).await {
            warn!(error = %e, "Broker link write failed");
            state.fail(format!("write failed: {}", e));
            return;
        }
    }
}
