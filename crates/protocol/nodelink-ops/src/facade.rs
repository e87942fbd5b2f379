//! Communication service facade.
//!
//! [`CommunicationService`] is the API the rest of the platform uses: the
//! reachable node set and network state model (cached), local services or
//! remote proxies for them, runtime peers and reachability checks.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nodelink_net::health::{health_check_request, is_valid_echo};
use nodelink_types::{NetworkContactPoint, NodeId, NodeIdentity};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{TopologyCache, TopologySnapshot, TopologySource};
use crate::discovery::{ReachabilityDiscovery, RoutedPeerLister};
use crate::error::{OpsError, OpsResult};
use crate::routing::{RoutingService, TopologyChange};
use crate::services::{RemoteServiceProxy, Service, ServiceProperties, ServiceRegistry};
use crate::state::NetworkStateModel;

/// Callback used to prove the local node can be reached.
pub trait ReachabilityChecker: Send + Sync {
    /// Called with the local node's identity.
    fn check_for_reachability(&self, node: &NodeIdentity);
}

/// Recomputes the topology with a discovery pass from the local node.
pub struct DiscoverySource {
    discovery: ReachabilityDiscovery,
    local: NodeIdentity,
}

impl DiscoverySource {
    pub fn new(discovery: ReachabilityDiscovery, local: NodeIdentity) -> Self {
        Self { discovery, local }
    }
}

#[async_trait]
impl TopologySource for DiscoverySource {
    async fn compute(&self) -> OpsResult<TopologySnapshot> {
        let report = self.discovery.discover(&self.local).await;
        let state = NetworkStateModel::from_identities(&report.reachable, &self.local.id);
        Ok(TopologySnapshot {
            reachable: report.reachable,
            state,
            generation: 0,
        })
    }
}

/// Facade over routing, discovery and the service registry.
///
/// Cheap to clone; all methods may be called concurrently.
#[derive(Clone)]
pub struct CommunicationService {
    inner: Arc<FacadeInner>,
}

struct FacadeInner {
    routing: RoutingService,
    registry: Arc<ServiceRegistry>,
    cache: Arc<TopologyCache>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl CommunicationService {
    /// Create the facade. Must be called inside a tokio runtime.
    pub fn new(routing: RoutingService, registry: Arc<ServiceRegistry>) -> Self {
        // Links learned by the cache's own pass must not invalidate the cache.
        let lister = Arc::new(RoutedPeerLister::new(routing.clone()).without_change_events());
        let discovery = ReachabilityDiscovery::new(lister, routing.config().dedup);
        let source = Arc::new(DiscoverySource::new(discovery, routing.local_identity().clone()));
        Self::with_source(routing, registry, source)
    }

    /// Create the facade with a custom topology source.
    pub fn with_source(
        routing: RoutingService,
        registry: Arc<ServiceRegistry>,
        source: Arc<dyn TopologySource>,
    ) -> Self {
        let cache = Arc::new(TopologyCache::new(source));
        let watcher = cache.watch(routing.subscribe());
        Self {
            inner: Arc::new(FacadeInner {
                routing,
                registry,
                cache,
                watcher: Mutex::new(Some(watcher)),
            }),
        }
    }

    pub fn local_identity(&self) -> &NodeIdentity {
        self.inner.routing.local_identity()
    }

    /// Whether `node` is the local node.
    pub fn is_local(&self, node: &NodeId) -> bool {
        self.local_identity().id == *node
    }

    pub fn routing(&self) -> &RoutingService {
        &self.inner.routing
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.inner.registry
    }

    pub fn cache(&self) -> &Arc<TopologyCache> {
        &self.inner.cache
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// Reachable workflow hosts and the local node, sorted by id.
    ///
    /// Served from the cache unless it is stale or `force_refresh` is set.
    /// Never fails; a degraded network yields a smaller or empty set.
    pub async fn get_available_nodes(&self, force_refresh: bool) -> Vec<NodeIdentity> {
        let local = &self.local_identity().id;
        self.inner
            .cache
            .get(force_refresh)
            .await
            .reachable
            .iter()
            .filter(|n| n.is_workflow_host || n.id == *local)
            .cloned()
            .collect()
    }

    /// State model of all reachable nodes.
    pub async fn get_current_network_state(&self) -> NetworkStateModel {
        self.inner.cache.get(false).await.state.clone()
    }

    /// Subscribe to topology changes.
    pub fn subscribe_topology(&self) -> broadcast::Receiver<TopologyChange> {
        self.inner.routing.subscribe()
    }

    pub fn network_summary(&self) -> String {
        self.inner.routing.network_summary()
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// A service by name and properties on `node`, the local node if `None`.
    ///
    /// Local services are looked up in the registry. For any other node a
    /// proxy is returned without contacting it; errors surface on invocation.
    pub fn get_service(
        &self,
        name: &str,
        properties: &ServiceProperties,
        node: Option<&NodeId>,
    ) -> OpsResult<Arc<dyn Service>> {
        match node {
            Some(target) if !self.is_local(target) => {
                debug!(service = name, node = %target, "Creating remote service proxy");
                Ok(Arc::new(RemoteServiceProxy::new(
                    self.inner.routing.clone(),
                    target.clone(),
                    name,
                    properties.clone(),
                    self.inner.routing.config().call_timeout,
                )))
            }
            _ => self
                .inner
                .registry
                .find(name, properties)
                .ok_or_else(|| OpsError::ServiceNotAvailable(name.to_string())),
        }
    }

    // =========================================================================
    // Peers
    // =========================================================================

    /// Parse `descriptor` as a contact point and connect to it.
    ///
    /// The connection shows up in the topology like any other; returns the
    /// identity of the peer.
    pub async fn add_runtime_peer(&self, descriptor: &str) -> OpsResult<NodeIdentity> {
        let contact_point: NetworkContactPoint = descriptor.parse()?;
        let connection = self.inner.routing.network().connect(&contact_point, true).await?;
        let remote = connection
            .remote()
            .cloned()
            .ok_or_else(|| OpsError::invalid_operation("connection has no remote identity"))?;
        info!(peer = %remote.id, contact = %contact_point, "Runtime peer added");
        Ok(remote)
    }

    /// Let `checker` verify the local node is reachable.
    pub fn check_reachability(&self, checker: &dyn ReachabilityChecker) {
        checker.check_for_reachability(self.local_identity());
    }

    /// Round trip of a routed health check to `node`.
    pub async fn probe(&self, node: &NodeId, timeout: Duration) -> OpsResult<Duration> {
        let request = health_check_request();
        let started = Instant::now();
        let response = self.inner.routing.send_routed(request.clone(), node, timeout).await;
        if is_valid_echo(&request, &response) {
            return Ok(started.elapsed());
        }
        Err(OpsError::Remote {
            code: response.result_code(),
            message: response
                .error_message()
                .unwrap_or("health check echo did not match")
                .to_string(),
        })
    }

    /// Stop background tasks.
    pub fn shutdown(&self) {
        if let Some(watcher) = self.inner.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            watcher.abort();
        }
        self.inner.routing.shutdown();
    }
}
