//! TCP front end of a [`MessageBroker`].

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::queues::MessageBroker;
use crate::codec::{read_frame, write_frame, BrokerFrame};
use crate::error::{NetworkError, NetworkResult};

/// Longest receive wait the server honors for a single frame.
const MAX_RECEIVE_WAIT: Duration = Duration::from_secs(300);

/// Accepts broker links and serves their operations against one broker.
pub struct BrokerServer {
    local_addr: SocketAddr,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BrokerServer {
    /// Bind `addr` and start accepting links.
    pub async fn bind(
        addr: &str,
        broker: Arc<MessageBroker>,
        max_frame_size: usize,
    ) -> NetworkResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::ConnectFailed(format!("cannot bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Broker listening");

        let links: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            broker,
            Arc::clone(&links),
            max_frame_size,
        ));

        Ok(Self {
            local_addr,
            accept_task: Mutex::new(Some(accept_task)),
            links,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new links. Established links keep being served.
    pub fn stop_accepting(&self) {
        if let Some(task) = self.accept_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
            info!(address = %self.local_addr, "Broker stopped accepting links");
        }
    }

    /// Stop accepting and drop every established link.
    pub fn shutdown(&self) {
        self.stop_accepting();
        for link in self.links.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            link.abort();
        }
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    broker: Arc<MessageBroker>,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
    max_frame_size: usize,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted broker link");
                let handle = tokio::spawn(serve_link(stream, peer, Arc::clone(&broker), max_frame_size));
                let mut links = links.lock().unwrap_or_else(|e| e.into_inner());
                links.retain(|h| !h.is_finished());
                links.push(handle);
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept broker link");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Serve one link until it closes, then delete the temporary queues it created.
async fn serve_link(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<MessageBroker>,
    max_frame_size: usize,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let (replies, replies_rx) = mpsc::channel::<BrokerFrame>(256);
    let writer_task = tokio::spawn(write_replies(writer, replies_rx, max_frame_size));

    let mut receives = JoinSet::new();
    let mut temporary = HashSet::new();

    loop {
        let frame = match read_frame(&mut reader, max_frame_size).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Broker link ended");
                break;
            }
        };

        // Reap finished receive tasks.
        while receives.try_join_next().is_some() {}

        let reply = match frame {
            BrokerFrame::Send { id, message } => Some(match broker.send(message) {
                Ok(()) => BrokerFrame::Ack { id },
                Err(e) => error_frame(id, e),
            }),
            BrokerFrame::Receive {
                id,
                queue,
                timeout_ms,
            } => {
                let broker = Arc::clone(&broker);
                let replies = replies.clone();
                let wait = Duration::from_millis(timeout_ms).min(MAX_RECEIVE_WAIT);
                receives.spawn(async move {
                    let reply = match broker.receive(&queue, wait).await {
                        Ok(message) => BrokerFrame::Delivered { id, message },
                        Err(e) => error_frame(id, e),
                    };
                    let _ = replies.send(reply).await;
                });
                None
            }
            BrokerFrame::CreateTemporaryQueue { id } => Some(match broker.create_temporary_queue() {
                Ok(queue) => {
                    temporary.insert(queue.clone());
                    BrokerFrame::QueueCreated { id, queue }
                }
                Err(e) => error_frame(id, e),
            }),
            BrokerFrame::DeleteQueue { id, queue } => {
                temporary.remove(&queue);
                broker.delete_queue(&queue);
                Some(BrokerFrame::Ack { id })
            }
            reply => {
                warn!(peer = %peer, frame = ?reply, "Client sent a reply frame, closing link");
                break;
            }
        };

        if let Some(reply) = reply {
            if replies.send(reply).await.is_err() {
                break;
            }
        }
    }

    receives.abort_all();
    writer_task.abort();
    for queue in temporary {
        broker.delete_queue(&queue);
    }
}

fn error_frame(id: u64, error: NetworkError) -> BrokerFrame {
    BrokerFrame::Error {
        id,
        message: error.to_string(),
    }
}

async fn write_replies(
    mut writer: OwnedWriteHalf,
    mut replies: mpsc::Receiver<BrokerFrame>,
    max_frame_size: usize,
) {
    while let Some(frame) = replies.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame, max_frame_size).await {
            debug!(error = %e, "Failed to write broker reply");
            return;
        }
    }
}
