//! Recursive reachability discovery.
//!
//! Starting from the local node, each node is asked to list its peers;
//! newly reported peers are asked in turn. A visited set stops the walk on
//! cycles. Every node that answered is reachable; a node whose listing
//! fails is logged and left out, and not asked again in the same pass.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use nodelink_net::{NetworkConnectionService, RequestHandler};
use nodelink_types::{categories, NetworkRequest, NetworkResponse, NodeId, NodeIdentity};
use nodelink_wire::{decode_payload, encode_payload};
use tracing::{debug, warn};

use crate::config::DedupPolicy;
use crate::error::{OpsError, OpsResult};
use crate::routing::{topics, RoutingService};

// =============================================================================
// Peer Listing
// =============================================================================

/// Source of peer listings.
#[async_trait]
pub trait PeerLister: Send + Sync {
    /// Peers `node` is directly connected to.
    async fn list_peers(&self, node: &NodeIdentity) -> OpsResult<Vec<NodeIdentity>>;
}

/// A peer listing request.
pub fn list_peers_request() -> NetworkRequest {
    NetworkRequest::builder()
        .category(categories::ROUTING)
        .topic(topics::LIST_PEERS)
        .build()
}

/// Answers peer listing requests with the directly connected nodes.
pub struct PeerListingHandler {
    network: NetworkConnectionService,
}

impl PeerListingHandler {
    pub fn new(network: NetworkConnectionService) -> Self {
        Self { network }
    }
}

#[async_trait]
impl RequestHandler for PeerListingHandler {
    fn is_applicable(&self, request: &NetworkRequest) -> bool {
        request.category() == Some(categories::ROUTING) && request.topic() == Some(topics::LIST_PEERS)
    }

    async fn handle(&self, request: &NetworkRequest, _sender: &NodeId) -> anyhow::Result<NetworkResponse> {
        let peers = self.network.connected_nodes();
        Ok(NetworkResponse::success(request, encode_payload(&peers)?))
    }
}

/// Lists peers of remote nodes with routed requests.
///
/// Listings are recorded in the routing topology, so later probes can
/// reach nodes further out.
pub struct RoutedPeerLister {
    routing: RoutingService,
    publish_changes: bool,
}

impl RoutedPeerLister {
    pub fn new(routing: RoutingService) -> Self {
        Self {
            routing,
            publish_changes: true,
        }
    }

    /// Record links learned from remote listings without publishing
    /// topology changes. Changes to the local node's own links are still
    /// published.
    pub fn without_change_events(mut self) -> Self {
        self.publish_changes = false;
        self
    }

    fn record(&self, node: &NodeIdentity, peers: &[NodeIdentity]) {
        if self.publish_changes || node.id == self.routing.local_identity().id {
            self.routing.learn_links(node, peers);
        } else {
            self.routing.record_links(node, peers);
        }
    }
}

#[async_trait]
impl PeerLister for RoutedPeerLister {
    async fn list_peers(&self, node: &NodeIdentity) -> OpsResult<Vec<NodeIdentity>> {
        if node.id == self.routing.local_identity().id {
            let peers = self.routing.direct_peers();
            self.record(node, &peers);
            return Ok(peers);
        }

        let timeout = self.routing.config().probe_timeout;
        let response = self.routing.send_routed(list_peers_request(), &node.id, timeout).await;
        if !response.is_success() {
            return Err(OpsError::Remote {
                code: response.result_code(),
                message: response.error_message().unwrap_or_default().to_string(),
            });
        }
        let peers: Vec<NodeIdentity> = decode_payload(response.content())?;
        self.record(node, &peers);
        Ok(peers)
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// One way a node was reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredRoute {
    /// The node reached.
    pub node: NodeId,
    /// The node that reported it; `None` for the starting node.
    pub via: Option<NodeId>,
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Nodes that answered, sorted by id.
    pub reachable: Vec<NodeIdentity>,
    /// Routes recorded, in discovery order.
    pub routes: Vec<DiscoveredRoute>,
    /// Nodes whose listing failed, sorted by id.
    pub unreachable: Vec<NodeId>,
    /// Number of listings requested.
    pub probes: usize,
}

impl DiscoveryReport {
    pub fn is_reachable(&self, id: &NodeId) -> bool {
        self.reachable.iter().any(|n| n.id == *id)
    }

    pub fn reachable_ids(&self) -> Vec<NodeId> {
        self.reachable.iter().map(|n| n.id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum VisitKey {
    Node(NodeId),
    Route(Option<NodeId>, NodeId),
}

/// Recursive peer-listing walk.
pub struct ReachabilityDiscovery {
    lister: Arc<dyn PeerLister>,
    dedup: DedupPolicy,
}

impl ReachabilityDiscovery {
    pub fn new(lister: Arc<dyn PeerLister>, dedup: DedupPolicy) -> Self {
        Self { lister, dedup }
    }

    pub fn dedup(&self) -> DedupPolicy {
        self.dedup
    }

    fn visit_key(&self, node: &NodeId, via: Option<&NodeId>) -> VisitKey {
        match self.dedup {
            DedupPolicy::ByNodeId => VisitKey::Node(node.clone()),
            DedupPolicy::ByRoute => VisitKey::Route(via.cloned(), node.clone()),
        }
    }

    /// Walk the network from `start`.
    ///
    /// Each node is listed at most once per pass, whatever the dedup
    /// policy; the policy only decides which routes are recorded.
    pub async fn discover(&self, start: &NodeIdentity) -> DiscoveryReport {
        let mut visited: HashSet<VisitKey> = HashSet::new();
        let mut worklist: VecDeque<(NodeIdentity, Option<NodeId>)> = VecDeque::new();
        let mut listed: HashMap<NodeId, Vec<NodeIdentity>> = HashMap::new();
        let mut reachable: BTreeMap<NodeId, NodeIdentity> = BTreeMap::new();
        let mut failed: BTreeMap<NodeId, ()> = BTreeMap::new();
        let mut report = DiscoveryReport::default();

        visited.insert(self.visit_key(&start.id, None));
        worklist.push_back((start.clone(), None));

        while let Some((node, via)) = worklist.pop_front() {
            if failed.contains_key(&node.id) {
                continue;
            }

            let peers = match listed.get(&node.id) {
                Some(peers) => peers.clone(),
                None => {
                    report.probes += 1;
                    match self.lister.list_peers(&node).await {
                        Ok(peers) => {
                            listed.insert(node.id.clone(), peers.clone());
                            peers
                        }
                        Err(e) => {
                            warn!(node = %node.id, error = %e, "Node not reachable; removed from reachable set");
                            failed.insert(node.id.clone(), ());
                            continue;
                        }
                    }
                }
            };

            report.routes.push(DiscoveredRoute {
                node: node.id.clone(),
                via: via.clone(),
            });
            reachable.entry(node.id.clone()).or_insert_with(|| node.clone());

            for peer in peers {
                if visited.insert(self.visit_key(&peer.id, Some(&node.id))) {
                    worklist.push_back((peer, Some(node.id.clone())));
                }
            }
        }

        report.reachable = reachable.into_values().collect();
        report.unreachable = failed.into_keys().collect();
        debug!(
            start = %start.id,
            reachable = report.reachable.len(),
            unreachable = report.unreachable.len(),
            probes = report.probes,
            "Discovery pass finished"
        );
        report
    }
}
