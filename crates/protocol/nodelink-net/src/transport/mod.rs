//! Transport providers and the state they share with the connection service.
//!
//! # Module Organization
//!
//! - [`broker`] - TCP broker transport with a passive inbox for duplex traffic
//! - [`virtual_net`] - In-process transport for tests and embedded topologies

pub mod broker;
pub mod virtual_net;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nodelink_types::{NetworkContactPoint, NodeIdentity};
use tokio::sync::mpsc;

use crate::config::NetworkConfig;
use crate::connection::ConnectionIdFactory;
use crate::event::{BrokenConnection, BrokenConnectionSink};
use crate::pool::WorkerPool;
use crate::traits::ConnectionEndpointHandler;

/// Resources every connection created by a node draws on.
#[derive(Clone)]
pub struct TransportContext {
    /// Network configuration.
    pub config: NetworkConfig,
    /// Pool running dispatch and asynchronous sends.
    pub pool: WorkerPool,
    /// Connection id source.
    pub ids: Arc<ConnectionIdFactory>,
    /// Where connections report that they broke.
    pub broken: BrokenConnectionSink,
}

impl TransportContext {
    /// Create a context and the receiving end of its broken-connection channel.
    pub fn new(config: NetworkConfig) -> (Self, mpsc::UnboundedReceiver<BrokenConnection>) {
        let (broken, broken_rx) = mpsc::unbounded_channel();
        let context = Self {
            pool: WorkerPool::new(config.worker_pool_size),
            ids: Arc::new(ConnectionIdFactory::new()),
            config,
            broken,
        };
        (context, broken_rx)
    }
}

/// A contact point a node serves, with the handler answering on it.
pub struct ServerContactPoint {
    contact_point: NetworkContactPoint,
    local: NodeIdentity,
    handler: Arc<dyn ConnectionEndpointHandler>,
    context: TransportContext,
    accepting: AtomicBool,
    bound: Mutex<Option<NetworkContactPoint>>,
}

impl ServerContactPoint {
    /// Describe a server. It does not accept handshakes until started.
    pub fn new(
        contact_point: NetworkContactPoint,
        local: NodeIdentity,
        handler: Arc<dyn ConnectionEndpointHandler>,
        context: TransportContext,
    ) -> Self {
        Self {
            contact_point,
            local,
            handler,
            context,
            accepting: AtomicBool::new(false),
            bound: Mutex::new(None),
        }
    }

    /// Contact point as configured.
    pub fn contact_point(&self) -> &NetworkContactPoint {
        &self.contact_point
    }

    /// Contact point actually served, once started.
    pub fn bound(&self) -> Option<NetworkContactPoint> {
        self.bound.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_bound(&self, bound: NetworkContactPoint) {
        *self.bound.lock().unwrap_or_else(|e| e.into_inner()) = Some(bound);
    }

    /// Identity of the serving node.
    pub fn local(&self) -> &NodeIdentity {
        &self.local
    }

    /// Handler receiving handshakes and requests.
    pub fn handler(&self) -> Arc<dyn ConnectionEndpointHandler> {
        Arc::clone(&self.handler)
    }

    /// Resources for connections created by this server.
    pub fn context(&self) -> &TransportContext {
        &self.context
    }

    /// Whether new handshakes are accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Open or close the server for new handshakes.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ServerContactPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContactPoint")
            .field("contact_point", &self.contact_point)
            .field("local", &self.local.id)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}
