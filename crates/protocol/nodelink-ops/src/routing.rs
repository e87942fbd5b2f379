//! Routing and topology.
//!
//! [`RoutingService`] keeps the local node's view of the network as a
//! [`TopologyGraph`], answers next-hop queries with the configured
//! [`RoutingStrategy`], and delivers routed requests: locally, to the next
//! hop, or as an `ExceptionWhileForwarding` failure when no route exists.
//!
//! Routed requests carry `type=routed`, the final `receiver`, the original
//! `sender`, a `hopcount`, and the path chosen by the origin. Intermediate
//! nodes follow the path while its next element is directly connected and
//! fall back to their own topology otherwise.
//!
//! Every change of the local view is published as a [`TopologyChange`].

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use nodelink_net::{Connection, NetworkConnectionService, NetworkEvent, RequestHandler};
use nodelink_types::{
    keys, CommunicationType, NetworkContact, NetworkContactPoint, NetworkRequest, NetworkResponse, NodeId,
    NodeIdentity, ResultCode,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{RoutingConfig, RoutingStrategy};
use crate::contact_map::CommunicationContactMap;
use crate::error::{OpsError, OpsResult};
use crate::topology::TopologyGraph;

/// Value of the `type` metadata key on routed requests.
pub const ROUTED_TYPE: &str = "routed";

/// Metadata key holding the comma-separated path chosen by the origin.
pub const ROUTE_PATH_KEY: &str = "routepath";

/// Request topics used by the routing layer.
pub mod topics {
    /// Peer listing request.
    pub const LIST_PEERS: &str = "listPeers";
}

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Whether `request` is a routed request.
pub fn is_routed(request: &NetworkRequest) -> bool {
    request.get(keys::TYPE) == Some(ROUTED_TYPE)
}

// =============================================================================
// Types
// =============================================================================

/// Where to send a request next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextHop {
    /// The target is the local node.
    Local,
    /// A directly connected node, with the full path to the target.
    Neighbor {
        /// Node to hand the request to.
        node: NodeId,
        /// Path from the local node to the target, both included.
        path: Vec<NodeId>,
    },
    /// A static contact to connect to.
    Contact(NetworkContact),
}

/// Why the topology changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChangeCause {
    /// A connection to the node was established.
    ConnectionEstablished(NodeId),
    /// A connection closed or broke.
    ConnectionLost(Option<NodeId>),
    /// A node reported its peers.
    LinksLearned(NodeId),
    /// A node was removed from the topology.
    NodeRemoved(NodeId),
    /// Events were missed and the local links were rebuilt.
    Resynchronized,
}

/// Notification that previously obtained topology snapshots are stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyChange {
    /// Sequence number, increasing by one per change.
    pub generation: u64,
    /// What changed.
    pub cause: TopologyChangeCause,
}

// =============================================================================
// RoutingService
// =============================================================================

/// Topology, next-hop lookup and routed delivery for one node.
///
/// Cheap to clone; clones share state. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct RoutingService {
    inner: Arc<RoutingInner>,
}

struct RoutingInner {
    local: NodeIdentity,
    network: NetworkConnectionService,
    config: RoutingConfig,
    contact_map: Arc<CommunicationContactMap>,
    topology: RwLock<TopologyGraph>,
    generation: AtomicU64,
    destination_handlers: RwLock<Vec<Arc<dyn RequestHandler>>>,
    changes: broadcast::Sender<TopologyChange>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoutingService {
    /// Create the routing service and hook it into `network`.
    ///
    /// Installs the routing request handler at the front of the network's
    /// dispatch chain and starts following its connection events.
    pub fn new(
        network: NetworkConnectionService,
        config: RoutingConfig,
        contact_map: Arc<CommunicationContactMap>,
    ) -> Self {
        let local = network.local_identity().clone();
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let events = network.subscribe();

        let inner = Arc::new(RoutingInner {
            topology: RwLock::new(TopologyGraph::new(local.clone())),
            local,
            network,
            config,
            contact_map,
            generation: AtomicU64::new(0),
            destination_handlers: RwLock::new(Vec::new()),
            changes,
            tasks: Mutex::new(Vec::new()),
        });

        inner.network.prepend_request_handler(Arc::new(ForwardingHandler {
            routing: Arc::downgrade(&inner),
        }));
        inner.refresh_local_links();

        let watcher = tokio::spawn(watch_network_events(Arc::downgrade(&inner), events));
        inner.tasks().push(watcher);

        Self { inner }
    }

    pub fn local_identity(&self) -> &NodeIdentity {
        &self.inner.local
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.inner.config
    }

    pub fn contact_map(&self) -> &Arc<CommunicationContactMap> {
        &self.inner.contact_map
    }

    /// The connection service underneath.
    pub fn network(&self) -> &NetworkConnectionService {
        &self.inner.network
    }

    /// Subscribe to topology changes.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyChange> {
        self.inner.changes.subscribe()
    }

    /// Number of changes published so far.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Append a handler for requests addressed to this node.
    pub fn add_destination_handler(&self, handler: Arc<dyn RequestHandler>) {
        write(&self.inner.destination_handlers).push(handler);
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// Nodes with an open connection to or from this node.
    pub fn direct_peers(&self) -> Vec<NodeIdentity> {
        self.inner.network.connected_nodes()
    }

    /// Record the peers `from` reported and publish a change if the
    /// topology changed. Returns true if it changed.
    pub fn learn_links(&self, from: &NodeIdentity, peers: &[NodeIdentity]) -> bool {
        let changed = self.record_links(from, peers);
        if changed {
            self.inner.emit(TopologyChangeCause::LinksLearned(from.id.clone()));
        }
        changed
    }

    /// Record the peers `from` reported without publishing a change.
    ///
    /// For the local node the links are rebuilt from the open connections.
    pub fn record_links(&self, from: &NodeIdentity, peers: &[NodeIdentity]) -> bool {
        if from.id == self.inner.local.id {
            return self.inner.refresh_local_links();
        }
        let mut topology = write(&self.inner.topology);
        let mut changed = topology.add_node(from.clone());
        for peer in peers.iter().filter(|p| p.id != self.inner.local.id) {
            changed |= topology.add_node(peer.clone());
        }
        changed | topology.set_links(&from.id, peers.iter().map(|p| p.id.clone()))
    }

    /// Drop a node from the topology.
    pub fn forget_node(&self, id: &NodeId) -> bool {
        if *id == self.inner.local.id {
            return false;
        }
        let removed = write(&self.inner.topology).remove_node(id);
        if removed {
            self.inner.emit(TopologyChangeCause::NodeRemoved(id.clone()));
        }
        removed
    }

    /// Snapshot of the current topology.
    pub fn topology(&self) -> TopologyGraph {
        read(&self.inner.topology).clone()
    }

    /// Nodes reachable over known links, including the local node.
    ///
    /// With `restrict_to_workflow_hosts_and_self`, only workflow hosts and
    /// the local node are returned.
    pub fn reachable_nodes(&self, restrict_to_workflow_hosts_and_self: bool) -> Vec<NodeIdentity> {
        let topology = read(&self.inner.topology);
        topology
            .reachable_from(&self.inner.local.id)
            .into_iter()
            .filter_map(|id| topology.node(&id).cloned())
            .filter(|n| !restrict_to_workflow_hosts_and_self || n.is_workflow_host || n.id == self.inner.local.id)
            .collect()
    }

    /// Identity of a node known from the topology or a handshake.
    pub fn node_info(&self, id: &NodeId) -> Option<NodeIdentity> {
        self.inner.node_info(id)
    }

    /// Human-readable description of the topology.
    pub fn network_summary(&self) -> String {
        read(&self.inner.topology).summary()
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Next hop towards `target`.
    pub fn next_hop(&self, target: &NodeId, communication_type: CommunicationType) -> OpsResult<NextHop> {
        self.inner.next_hop(target, communication_type)
    }

    /// Send `request` to `target` over however many hops it takes.
    ///
    /// Like `Connection::request`, never fails: a missing route, a broken
    /// next hop and remote errors come back as failure responses.
    pub async fn send_routed(&self, request: NetworkRequest, target: &NodeId, timeout: Duration) -> NetworkResponse {
        let mut request = request
            .with_metadata(keys::TYPE, ROUTED_TYPE)
            .with_metadata(keys::RECEIVER, target.as_str());
        if request.get(keys::SENDER).is_none() {
            request = request.with_metadata(keys::SENDER, self.inner.local.id.as_str());
        }
        self.inner.route(request, target, timeout).await
    }

    /// Dispatch a request addressed to this node to the destination handlers.
    pub async fn deliver_locally(&self, request: NetworkRequest, sender: NodeId) -> NetworkResponse {
        self.inner.deliver_locally(request, sender).await
    }

    /// Stop following network events.
    pub fn shutdown(&self) {
        for task in self.inner.tasks().drain(..) {
            task.abort();
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Shared State
// =============================================================================

impl RoutingInner {
    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, cause: TopologyChangeCause) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let topology = read(&self.topology);
            debug!(
                node = %self.local.id,
                generation,
                nodes = topology.node_count(),
                links = topology.link_count(),
                cause = ?cause,
                "Topology change detected"
            );
        }
        // No subscribers is fine.
        let _ = self.changes.send(TopologyChange { generation, cause });
    }

    /// Rebuild the local node's links from the open connections.
    fn refresh_local_links(&self) -> bool {
        let peers = self.network.connected_nodes();
        let mut topology = write(&self.topology);
        let mut changed = false;
        for peer in &peers {
            changed |= topology.add_node(peer.clone());
        }
        changed | topology.set_links(&self.local.id, peers.into_iter().map(|p| p.id))
    }

    fn on_network_event(&self, event: &NetworkEvent) {
        if !event.is_topology_change() {
            return;
        }
        let cause = match event {
            NetworkEvent::ConnectionEstablished { remote, .. } => {
                TopologyChangeCause::ConnectionEstablished(remote.id.clone())
            }
            other => TopologyChangeCause::ConnectionLost(other.remote().cloned()),
        };
        if self.refresh_local_links() {
            self.emit(cause);
        }
    }

    fn has_destination_handler(&self, request: &NetworkRequest) -> bool {
        read(&self.destination_handlers).iter().any(|h| h.is_applicable(request))
    }

    async fn deliver_locally(&self, request: NetworkRequest, sender: NodeId) -> NetworkResponse {
        let handler = read(&self.destination_handlers)
            .iter()
            .find(|h| h.is_applicable(&request))
            .cloned();
        let Some(handler) = handler else {
            debug!(request_id = %request.request_id(), "No destination handler applicable");
            return NetworkResponse::failure(
                &request,
                ResultCode::NoMatchingHandler,
                format!("No handler for request at {}", self.local.id),
            );
        };

        match AssertUnwindSafe(handler.handle(&request, &sender)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => NetworkResponse::failure(&request, ResultCode::ExceptionAtDestination, format!("{:#}", e)),
            Err(_) => NetworkResponse::failure(
                &request,
                ResultCode::ExceptionAtDestination,
                "Request handler panicked",
            ),
        }
    }

    /// Deliver a routed request, locally or to the next hop.
    async fn route(&self, request: NetworkRequest, target: &NodeId, timeout: Duration) -> NetworkResponse {
        let hops = request.hop_count();
        if hops > self.config.max_hop_count {
            let error = OpsError::HopLimitExceeded {
                hops,
                limit: self.config.max_hop_count,
            };
            warn!(request_id = %request.request_id(), target = %target, error = %error, "Dropping routed request");
            return NetworkResponse::failure(&request, error.result_code(), error);
        }

        if *target == self.local.id {
            let sender = request.sender().unwrap_or_else(|| self.local.id.clone());
            return self.deliver_locally(request, sender).await;
        }

        let next = match self.next_on_path(&request) {
            Some(node) => NextHop::Neighbor { node, path: Vec::new() },
            None => match self.next_hop(target, CommunicationType::ServiceCall) {
                Ok(next) => next,
                Err(e) => {
                    debug!(target = %target, error = %e, "No route");
                    return NetworkResponse::failure(
                        &request,
                        e.result_code(),
                        format!("Found no route towards '{}' at '{}'", target, self.local.id),
                    );
                }
            },
        };

        match next {
            NextHop::Local => {
                let sender = request.sender().unwrap_or_else(|| self.local.id.clone());
                self.deliver_locally(request, sender).await
            }
            NextHop::Neighbor { node, path } => {
                let request = if path.is_empty() {
                    request
                } else {
                    let path: Vec<&str> = path.iter().map(NodeId::as_str).collect();
                    request.with_metadata(ROUTE_PATH_KEY, path.join(","))
                };
                match self.network.connection_to(&node) {
                    Some(connection) => connection.request(request, timeout).await,
                    None => NetworkResponse::failure(
                        &request,
                        ResultCode::ExceptionWhileForwarding,
                        format!("No open connection to next hop '{}' at '{}'", node, self.local.id),
                    ),
                }
            }
            NextHop::Contact(contact) => match self.connection_for_contact(&contact).await {
                Ok(connection) => connection.request(request, timeout).await,
                Err(e) => NetworkResponse::failure(
                    &request,
                    ResultCode::ExceptionWhileForwarding,
                    format!("Could not reach {}: {}", contact, e),
                ),
            },
        }
    }

    fn node_info(&self, id: &NodeId) -> Option<NodeIdentity> {
        read(&self.topology)
            .node(id)
            .cloned()
            .or_else(|| self.network.node_info(id))
    }

    fn next_hop(&self, target: &NodeId, communication_type: CommunicationType) -> OpsResult<NextHop> {
        if *target == self.local.id {
            return Ok(NextHop::Local);
        }
        match self.config.strategy {
            RoutingStrategy::StaticContactMap => {
                let legacy = self
                    .node_info(target)
                    .and_then(|n| n.legacy_id)
                    .ok_or_else(|| OpsError::NoRoute(target.clone()))?;
                let contact = self.contact_map.get_contact(communication_type, &legacy)?;
                Ok(NextHop::Contact(contact))
            }
            RoutingStrategy::DynamicDiscovery => {
                let path = read(&self.topology)
                    .shortest_path(&self.local.id, target)
                    .ok_or_else(|| OpsError::NoRoute(target.clone()))?;
                let node = path.get(1).cloned().ok_or_else(|| OpsError::NoRoute(target.clone()))?;
                Ok(NextHop::Neighbor { node, path })
            }
        }
    }

    /// Successor of the local node on the path the origin chose, if directly connected.
    fn next_on_path(&self, request: &NetworkRequest) -> Option<NodeId> {
        let path: Vec<&str> = request.get(ROUTE_PATH_KEY)?.split(',').collect();
        let position = path.iter().position(|p| *p == self.local.id.as_str())?;
        let next = NodeId::new(*path.get(position + 1)?).ok()?;
        self.network.connection_to(&next).map(|_| next)
    }

    async fn connection_for_contact(&self, contact: &NetworkContact) -> OpsResult<Arc<Connection>> {
        let contact_point = NetworkContactPoint::new(contact.protocol.clone(), contact.host.clone(), contact.port);
        let existing = self
            .network
            .outgoing_connections()
            .into_iter()
            .find(|c| !c.is_closed() && c.contact_point() == Some(&contact_point));
        match existing {
            Some(connection) => Ok(connection),
            None => {
                info!(contact = %contact_point, "Connecting to static contact");
                Ok(self.network.connect(&contact_point, true).await?)
            }
        }
    }

    async fn forward(&self, request: &NetworkRequest, target: &NodeId) -> NetworkResponse {
        let forwarded = request.forwarded();
        debug!(
            request_id = %request.request_id(),
            sender = ?request.sender().map(|s| s.to_string()),
            target = %target,
            hops = forwarded.hop_count(),
            "Forwarding routed request"
        );
        let response = self.route(forwarded, target, self.config.forwarding_timeout).await;
        if response.result_code().is_timeout() {
            warn!(
                request_id = %request.request_id(),
                target = %target,
                "Timeout while forwarding routed request"
            );
            return NetworkResponse::failure(
                request,
                ResultCode::ExceptionWhileForwarding,
                format!("Timeout while forwarding towards '{}' at '{}'", target, self.local.id),
            );
        }
        response
    }
}

async fn watch_network_events(routing: Weak<RoutingInner>, mut events: broadcast::Receiver<NetworkEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(inner) = routing.upgrade() else { return };
                inner.on_network_event(&event);
            }
            Err(RecvError::Lagged(missed)) => {
                let Some(inner) = routing.upgrade() else { return };
                warn!(missed, "Missed network events; rebuilding local links");
                inner.refresh_local_links();
                inner.emit(TopologyChangeCause::Resynchronized);
            }
            Err(RecvError::Closed) => return,
        }
    }
}

// =============================================================================
// Routing Request Handler
// =============================================================================

/// Network-level handler for routed requests and requests addressed to this node.
struct ForwardingHandler {
    routing: Weak<RoutingInner>,
}

#[async_trait]
impl RequestHandler for ForwardingHandler {
    fn is_applicable(&self, request: &NetworkRequest) -> bool {
        match self.routing.upgrade() {
            Some(inner) => is_routed(request) || inner.has_destination_handler(request),
            None => false,
        }
    }

    async fn handle(&self, request: &NetworkRequest, sender: &NodeId) -> anyhow::Result<NetworkResponse> {
        let inner = self
            .routing
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("routing service shut down"))?;

        if !is_routed(request) {
            return Ok(inner.deliver_locally(request.clone(), sender.clone()).await);
        }
        let Some(target) = request.receiver() else {
            return Ok(NetworkResponse::failure(
                request,
                ResultCode::ProtocolError,
                "Routed request carries no receiver",
            ));
        };
        if target == inner.local.id {
            return Ok(inner.deliver_locally(request.clone(), sender.clone()).await);
        }
        Ok(inner.forward(request, &target).await)
    }
}
