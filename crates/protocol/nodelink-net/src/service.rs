//! The connection service.
//!
//! [`NetworkConnectionService`] owns a node's transport providers, servers
//! and connections. It is the node's [`ConnectionEndpointHandler`]: incoming
//! requests run through its chain of [`RequestHandler`]s, remote-initiated
//! connections are registered with it, and broken links are reported to it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use nodelink_net::{HealthCheckRequestHandler, NetworkConfig, NetworkConnectionService,
//!     VirtualNetwork, VirtualTransportProvider};
//! use nodelink_types::{NetworkContactPoint, NetworkRequest, NodeId, NodeIdentity};
//!
//! # async fn example() -> nodelink_net::NetworkResult<()> {
//! let network = VirtualNetwork::new();
//! let a = NetworkConnectionService::new(
//!     NodeIdentity::new(NodeId::new("aaa").unwrap(), "A"),
//!     NetworkConfig::default(),
//! );
//! let b = NetworkConnectionService::new(
//!     NodeIdentity::new(NodeId::new("bbb").unwrap(), "B"),
//!     NetworkConfig::default(),
//! );
//! for service in [&a, &b] {
//!     service.register_transport_provider(Arc::new(VirtualTransportProvider::new(network.clone())))?;
//! }
//! b.add_request_handler(Arc::new(HealthCheckRequestHandler));
//!
//! let contact = b.start_server(NetworkContactPoint::new("virtual", "b", 1)).await?;
//! let connection = a.connect(&contact, true).await?;
//! let request = NetworkRequest::builder()
//!     .category(nodelink_types::categories::HEALTH_CHECK)
//!     .content(b"ping".to_vec())
//!     .build();
//! let response = connection.request(request, Duration::from_secs(5)).await;
//! assert_eq!(response.content(), b"ping");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use nodelink_types::{NetworkContactPoint, NetworkRequest, NetworkResponse, NodeId, NodeIdentity, ResultCode};
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::connection::{Connection, ConnectionId, InitiationRole};
use crate::consumer::panic_message;
use crate::error::{NetworkError, NetworkResult};
use crate::event::{BrokenConnection, NetworkEvent};
use crate::health::{health_check_request, is_valid_echo, HealthMonitor, HealthOutcome};
use crate::traits::{ConnectionEndpointHandler, RequestHandler, TransportProvider};
use crate::transport::{ServerContactPoint, TransportContext};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Manages transports, servers and connections of one node.
///
/// Cheap to clone; clones share state. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct NetworkConnectionService {
    inner: Arc<ServiceInner>,
}

struct ServerEntry {
    contact_point: Arc<ServerContactPoint>,
    provider: Arc<dyn TransportProvider>,
}

struct ServiceInner {
    local: NodeIdentity,
    context: TransportContext,
    providers: RwLock<HashMap<String, Arc<dyn TransportProvider>>>,
    servers: Mutex<Vec<ServerEntry>>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    handlers: RwLock<Vec<Arc<dyn RequestHandler>>>,
    known_nodes: RwLock<HashMap<NodeId, NodeIdentity>>,
    health: HealthMonitor,
    events: broadcast::Sender<NetworkEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkConnectionService {
    /// Create a service for `local`.
    pub fn new(local: NodeIdentity, config: NetworkConfig) -> Self {
        let (context, broken_rx) = TransportContext::new(config);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(ServiceInner {
            local,
            context,
            providers: RwLock::new(HashMap::new()),
            servers: Mutex::new(Vec::new()),
            connections: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            known_nodes: RwLock::new(HashMap::new()),
            health: HealthMonitor::default(),
            events,
            tasks: Mutex::new(Vec::new()),
        });

        let watcher = tokio::spawn(watch_broken_connections(Arc::downgrade(&inner), broken_rx));
        inner.tasks().push(watcher);

        Self { inner }
    }

    /// Identity of this node.
    pub fn local_identity(&self) -> &NodeIdentity {
        &self.inner.local
    }

    /// Network configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.inner.context.config
    }

    /// Subscribe to network events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.events.subscribe()
    }

    /// Handler transports call back into.
    ///
    /// Holds the service weakly, so servers and connections do not keep it alive.
    pub fn endpoint_handler(&self) -> Arc<dyn ConnectionEndpointHandler> {
        Arc::new(EndpointHandle {
            inner: Arc::downgrade(&self.inner),
            local: self.inner.local.clone(),
        })
    }

    // =========================================================================
    // Transports and Handlers
    // =========================================================================

    /// Register a transport provider. Transport ids must be unique.
    pub fn register_transport_provider(&self, provider: Arc<dyn TransportProvider>) -> NetworkResult<()> {
        let id = provider.transport_id().to_string();
        let mut providers = write(&self.inner.providers);
        if providers.contains_key(&id) {
            return Err(NetworkError::DuplicateTransport(id));
        }
        debug!(transport = %id, "Registered transport provider");
        providers.insert(id, provider);
        Ok(())
    }

    fn provider(&self, transport_id: &str) -> NetworkResult<Arc<dyn TransportProvider>> {
        read(&self.inner.providers)
            .get(transport_id)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownTransport(transport_id.to_string()))
    }

    /// Append a request handler to the dispatch chain.
    pub fn add_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        write(&self.inner.handlers).push(handler);
    }

    /// Put a request handler in front of the dispatch chain.
    pub fn prepend_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        write(&self.inner.handlers).insert(0, handler);
    }

    // =========================================================================
    // Servers
    // =========================================================================

    /// Start serving `contact_point`; returns the effective contact point.
    pub async fn start_server(&self, contact_point: NetworkContactPoint) -> NetworkResult<NetworkContactPoint> {
        let provider = self.provider(&contact_point.transport_id)?;
        let key = contact_point.endpoint_key();

        let existing = self
            .inner
            .servers()
            .iter()
            .find(|s| s.contact_point.contact_point().endpoint_key() == key)
            .map(|s| Arc::clone(&s.contact_point));

        let server = match existing {
            Some(server) => server,
            None => {
                let server = Arc::new(ServerContactPoint::new(
                    contact_point,
                    self.inner.local.clone(),
                    self.endpoint_handler(),
                    self.inner.context.clone(),
                ));
                self.inner.servers().push(ServerEntry {
                    contact_point: Arc::clone(&server),
                    provider: Arc::clone(&provider),
                });
                server
            }
        };

        provider.start_server(server).await
    }

    /// Stop accepting handshakes on `contact_point`. Established connections stay open.
    pub async fn stop_server(&self, contact_point: &NetworkContactPoint) -> NetworkResult<()> {
        let key = contact_point.endpoint_key();
        let entry = self
            .inner
            .servers()
            .iter()
            .find(|s| s.contact_point.contact_point().endpoint_key() == key)
            .map(|s| (Arc::clone(&s.contact_point), Arc::clone(&s.provider)));

        match entry {
            Some((server, provider)) => provider.stop_server(&server).await,
            None => Ok(()),
        }
    }

    /// Contact points this node serves, using effective ports where known.
    pub fn server_contact_points(&self) -> Vec<NetworkContactPoint> {
        self.inner
            .servers()
            .iter()
            .filter(|s| s.contact_point.is_accepting())
            .map(|s| {
                s.contact_point
                    .bound()
                    .unwrap_or_else(|| s.contact_point.contact_point().clone())
            })
            .collect()
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Connect to `contact_point` and register the connection.
    pub async fn connect(&self, contact_point: &NetworkContactPoint, allow_duplex: bool) -> NetworkResult<Arc<Connection>> {
        let provider = self.provider(&contact_point.transport_id)?;
        let duplex = allow_duplex && provider.supports_remote_initiated_connections();

        let connection = provider
            .connect(
                contact_point,
                &self.inner.local,
                duplex,
                self.endpoint_handler(),
                &self.inner.context,
            )
            .await?;

        if let Some(remote) = connection.remote() {
            self.inner.remember_node(remote.clone());
        }
        self.inner.register_connection(Arc::clone(&connection));
        Ok(connection)
    }

    /// Register a connection. Returns false if it was already registered.
    pub fn register_connection(&self, connection: Arc<Connection>) -> bool {
        self.inner.register_connection(connection)
    }

    /// Look up a connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        read(&self.inner.connections).get(id).cloned()
    }

    /// All registered connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        read(&self.inner.connections).values().cloned().collect()
    }

    /// Registered self-initiated connections.
    pub fn outgoing_connections(&self) -> Vec<Arc<Connection>> {
        read(&self.inner.connections)
            .values()
            .filter(|c| c.is_self_initiated())
            .cloned()
            .collect()
    }

    /// An open connection to `node`, preferring self-initiated ones.
    pub fn connection_to(&self, node: &NodeId) -> Option<Arc<Connection>> {
        let connections = read(&self.inner.connections);
        let mut candidates: Vec<&Arc<Connection>> = connections
            .values()
            .filter(|c| !c.is_closed() && c.remote_id() == Some(node))
            .collect();
        candidates.sort_by_key(|c| (!c.is_self_initiated(), c.id().clone()));
        candidates.first().map(|c| Arc::clone(c))
    }

    /// Distinct remote nodes with at least one open connection.
    pub fn connected_nodes(&self) -> Vec<NodeIdentity> {
        let mut nodes: HashMap<NodeId, NodeIdentity> = HashMap::new();
        for connection in read(&self.inner.connections).values() {
            if let Some(remote) = connection.remote().filter(|_| !connection.is_closed()) {
                nodes.entry(remote.id.clone()).or_insert_with(|| remote.clone());
            }
        }
        let mut nodes: Vec<NodeIdentity> = nodes.into_values().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Send a request over a registered connection.
    pub async fn send_request(
        &self,
        connection_id: &ConnectionId,
        request: NetworkRequest,
        timeout: Duration,
    ) -> NetworkResult<NetworkResponse> {
        let connection = self
            .connection(connection_id)
            .ok_or_else(|| NetworkError::UnknownConnection(connection_id.to_string()))?;
        Ok(connection.request(request, timeout).await)
    }

    /// Close and unregister a connection.
    pub async fn close_connection(&self, connection_id: &ConnectionId) -> NetworkResult<()> {
        let connection = write(&self.inner.connections)
            .remove(connection_id)
            .ok_or_else(|| NetworkError::UnknownConnection(connection_id.to_string()))?;
        self.inner.health.forget(connection_id);
        connection.close().await;
        self.inner.emit(NetworkEvent::ConnectionClosed {
            connection_id: connection_id.clone(),
            remote: connection.remote_id().cloned(),
        });
        Ok(())
    }

    /// Close every self-initiated connection.
    pub async fn close_all_outgoing_connections(&self) {
        for connection in self.outgoing_connections() {
            let _ = self.close_connection(connection.id()).await;
        }
    }

    /// Every node seen in a handshake.
    pub fn known_nodes(&self) -> Vec<NodeIdentity> {
        let mut nodes: Vec<NodeIdentity> = read(&self.inner.known_nodes).values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Identity of a node seen in a handshake.
    pub fn node_info(&self, id: &NodeId) -> Option<NodeIdentity> {
        read(&self.inner.known_nodes).get(id).cloned()
    }

    // =========================================================================
    // Health Checks
    // =========================================================================

    /// Check one connection now.
    ///
    /// Reaching the failure limit reports the connection broken, which
    /// unregisters it.
    pub async fn check_connection_health(&self, connection_id: &ConnectionId) -> HealthOutcome {
        let Some(connection) = self.connection(connection_id) else {
            return HealthOutcome::Skipped;
        };
        if connection.is_closed() || !self.inner.health.try_begin(connection_id) {
            return HealthOutcome::Skipped;
        }

        let settings = &self.inner.context.config.health_check;
        let request = health_check_request();
        let response = connection.request(request.clone(), settings.timeout).await;

        if is_valid_echo(&request, &response) {
            let previous = self.inner.health.record_success(connection_id);
            if previous > 0 {
                info!(connection = %connection_id, previous_failures = previous, "Connection recovered");
                self.inner.emit(NetworkEvent::HealthCheckRecovered {
                    connection_id: connection_id.clone(),
                    previous_failures: previous,
                });
            }
            return HealthOutcome::Healthy {
                recovered_from: previous,
            };
        }

        let Some(consecutive) = self.inner.health.record_failure(connection_id) else {
            debug!(connection = %connection_id, "Connection went away during health check");
            return HealthOutcome::Skipped;
        };
        warn!(
            connection = %connection_id,
            consecutive_failures = consecutive,
            result = %response.result_code(),
            "Health check failed"
        );
        self.inner.emit(NetworkEvent::HealthCheckFailed {
            connection_id: connection_id.clone(),
            consecutive_failures: consecutive,
        });

        if consecutive >= settings.failure_limit {
            connection.report_broken(format!("{} consecutive health check failures", consecutive));
            HealthOutcome::Broken { consecutive }
        } else {
            HealthOutcome::Failed { consecutive }
        }
    }

    /// Run one round of checks over all self-initiated connections.
    ///
    /// Each check starts after a random delay up to the configured jitter.
    pub async fn run_health_checks(&self) {
        let max_jitter = self.inner.context.config.health_check.max_jitter;
        let checks = self.outgoing_connections().into_iter().map(|connection| {
            let service = self.clone();
            let jitter = random_jitter(max_jitter);
            async move {
                tokio::time::sleep(jitter).await;
                service.check_connection_health(connection.id()).await
            }
        });
        futures::future::join_all(checks).await;
    }

    /// Start the periodic health-check task, if enabled.
    pub fn start_health_checks(&self) {
        let settings = &self.inner.context.config.health_check;
        if !settings.enabled {
            debug!("Health checks disabled");
            return;
        }
        let interval = settings.interval;
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                let service = NetworkConnectionService { inner };
                let round = service.clone();
                service.inner.context.pool.spawn(async move { round.run_health_checks().await });
            }
        });
        self.inner.tasks().push(task);
    }

    /// Close every connection and server and stop background tasks.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<Connection>> = write(&self.inner.connections).drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.close().await;
        }
        let providers: Vec<Arc<dyn TransportProvider>> = read(&self.inner.providers).values().cloned().collect();
        for provider in providers {
            provider.shutdown().await;
        }
        for task in self.inner.tasks().drain(..) {
            task.abort();
        }
        info!(node = %self.inner.local.id, "Connection service shut down");
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
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

impl ServiceInner {
    fn servers(&self) -> std::sync::MutexGuard<'_, Vec<ServerEntry>> {
        self.servers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: NetworkEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn remember_node(&self, identity: NodeIdentity) {
        write(&self.known_nodes).insert(identity.id.clone(), identity);
    }

    fn register_connection(&self, connection: Arc<Connection>) -> bool {
        {
            let mut connections = write(&self.connections);
            if connections.contains_key(connection.id()) {
                return false;
            }
            connections.insert(connection.id().clone(), Arc::clone(&connection));
        }
        if let Some(remote) = connection.remote() {
            self.emit(NetworkEvent::ConnectionEstablished {
                connection_id: connection.id().clone(),
                role: connection.role(),
                remote: remote.clone(),
            });
        }
        true
    }

    async fn handle_broken(&self, report: BrokenConnection) {
        if report.role == InitiationRole::RemoteInitiated {
            debug!(connection = %report.connection_id, "Ignoring broken report for remote-initiated connection");
            return;
        }

        let removed = write(&self.connections).remove(&report.connection_id);
        self.health.forget(&report.connection_id);
        let Some(connection) = removed else {
            return;
        };
        connection.close().await;

        warn!(
            connection = %report.connection_id,
            remote = ?report.remote.as_ref().map(NodeId::as_str),
            reason = %report.reason,
            "Connection declared broken"
        );
        self.emit(NetworkEvent::ConnectionBroken {
            connection_id: report.connection_id,
            remote: report.remote,
            reason: report.reason,
        });
    }

    async fn close_lost_connection(&self, connection: Arc<Connection>) {
        let removed = {
            let mut connections = write(&self.connections);
            let registered = connections
                .get(connection.id())
                .is_some_and(|registered| Arc::ptr_eq(registered, &connection));
            if registered {
                connections.remove(connection.id())
            } else {
                None
            }
        };
        let Some(connection) = removed else {
            return;
        };
        self.health.forget(connection.id());
        connection.close().await;

        info!(
            connection = %connection.id(),
            remote = ?connection.remote_id().map(NodeId::as_str),
            "Initiator went away"
        );
        self.emit(NetworkEvent::ConnectionClosed {
            connection_id: connection.id().clone(),
            remote: connection.remote_id().cloned(),
        });
    }

    async fn dispatch(&self, request: NetworkRequest, sender: NodeId) -> NetworkResponse {
        self.emit(NetworkEvent::RequestReceived {
            sender: sender.clone(),
            request_id: request.request_id().to_string(),
            category: request.category().map(str::to_string),
        });

        let handlers: Vec<Arc<dyn RequestHandler>> = read(&self.handlers).clone();
        let Some(handler) = handlers.into_iter().find(|h| h.is_applicable(&request)) else {
            debug!(request_id = %request.request_id(), category = ?request.category(), "No matching handler");
            return NetworkResponse::failure(
                &request,
                ResultCode::NoMatchingHandler,
                format!(
                    "No handler for request (category={}, topic={})",
                    request.category().unwrap_or("-"),
                    request.topic().unwrap_or("-")
                ),
            );
        };

        match AssertUnwindSafe(handler.handle(&request, &sender)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(request_id = %request.request_id(), sender = %sender, error = %e, "Request handler failed");
                NetworkResponse::failure(&request, ResultCode::ExceptionAtDestination, format!("{:#}", e))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(request_id = %request.request_id(), sender = %sender, panic = %message, "Request handler panicked");
                NetworkResponse::failure(
                    &request,
                    ResultCode::ExceptionAtDestination,
                    format!("Request handler panicked: {}", message),
                )
            }
        }
    }
}

async fn watch_broken_connections(inner: Weak<ServiceInner>, mut reports: mpsc::UnboundedReceiver<BrokenConnection>) {
    while let Some(report) = reports.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        inner.handle_broken(report).await;
    }
}

/// Endpoint handler given to transports; holds the service weakly.
struct EndpointHandle {
    inner: Weak<ServiceInner>,
    local: NodeIdentity,
}

#[async_trait]
impl ConnectionEndpointHandler for EndpointHandle {
    fn exchange_node_information(&self, remote: &NodeIdentity) -> NodeIdentity {
        if let Some(inner) = self.inner.upgrade() {
            inner.remember_node(remote.clone());
        }
        self.local.clone()
    }

    async fn on_remote_initiated_connection_established(
        &self,
        connection: Arc<Connection>,
        contact_point: &ServerContactPoint,
    ) {
        let Some(inner) = self.inner.upgrade() else { return };
        debug!(
            connection = %connection.id(),
            remote = ?connection.remote_id().map(NodeId::as_str),
            contact_point = %contact_point.contact_point(),
            "Remote-initiated connection established"
        );
        inner.register_connection(connection);
    }

    async fn on_remote_initiated_connection_lost(&self, connection: Arc<Connection>) {
        let Some(inner) = self.inner.upgrade() else { return };
        inner.close_lost_connection(connection).await;
    }

    async fn on_raw_request_received(&self, request: NetworkRequest, sender: NodeId) -> NetworkResponse {
        match self.inner.upgrade() {
            Some(inner) => inner.dispatch(request, sender).await,
            None => NetworkResponse::failure(&request, ResultCode::ConnectionBroken, "Node is shutting down"),
        }
    }
}
