//! Node assembly.
//!
//! A [`Node`] is the application context of one peer: identity, connection
//! service, transport providers, routing, service registry and facade. Any
//! number of nodes can live in one process; nodes on the same
//! [`VirtualNetwork`] reach each other without sockets.

use std::sync::Arc;
use std::time::Duration;

use nodelink_net::{
    BrokerTransportProvider, HealthCheckRequestHandler, NetworkConfig, NetworkConnectionService, VirtualNetwork,
    VirtualTransportProvider,
};
use nodelink_types::constants::STARTUP_CONNECT_DELAY_MS;
use nodelink_types::{CommunicationType, NetworkContactPoint, NodeIdentity};
use tracing::{info, warn};

use crate::config::RoutingConfig;
use crate::contact_map::CommunicationContactMap;
use crate::discovery::PeerListingHandler;
use crate::error::OpsResult;
use crate::facade::CommunicationService;
use crate::routing::RoutingService;
use crate::services::{Service, ServiceCallHandler, ServiceProperties, ServiceRegistry};

/// Builder for [`Node`].
pub struct NodeBuilder {
    identity: NodeIdentity,
    network_config: NetworkConfig,
    routing_config: RoutingConfig,
    virtual_network: Option<VirtualNetwork>,
    broker: bool,
    listen_on: Vec<NetworkContactPoint>,
    static_contacts: Vec<NetworkContactPoint>,
    contact_mappings: Vec<(CommunicationType, String)>,
    services: Vec<(Arc<dyn Service>, ServiceProperties)>,
    connect_delay: Duration,
}

impl NodeBuilder {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            network_config: NetworkConfig::default(),
            routing_config: RoutingConfig::default(),
            virtual_network: None,
            broker: true,
            listen_on: Vec::new(),
            static_contacts: Vec::new(),
            contact_mappings: Vec::new(),
            services: Vec::new(),
            connect_delay: Duration::from_millis(STARTUP_CONNECT_DELAY_MS),
        }
    }

    pub fn network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = config;
        self
    }

    pub fn routing_config(mut self, config: RoutingConfig) -> Self {
        self.routing_config = config;
        self
    }

    /// Attach the in-process transport on `network`.
    pub fn virtual_network(mut self, network: VirtualNetwork) -> Self {
        self.virtual_network = Some(network);
        self
    }

    /// Enable or disable the TCP broker transport (enabled by default).
    pub fn broker(mut self, enabled: bool) -> Self {
        self.broker = enabled;
        self
    }

    /// Serve `contact_point` once started.
    pub fn listen_on(mut self, contact_point: NetworkContactPoint) -> Self {
        self.listen_on.push(contact_point);
        self
    }

    /// Connect to `contact_point` after startup.
    pub fn static_contact(mut self, contact_point: NetworkContactPoint) -> Self {
        self.static_contacts.push(contact_point);
        self
    }

    /// Add a `pattern=contact` line to the static contact map.
    pub fn contact_mapping(mut self, communication_type: CommunicationType, line: impl Into<String>) -> Self {
        self.contact_mappings.push((communication_type, line.into()));
        self
    }

    /// Register a local service.
    pub fn service(mut self, service: Arc<dyn Service>, properties: ServiceProperties) -> Self {
        self.services.push((service, properties));
        self
    }

    /// Delay before static contacts are connected.
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Assemble the node. Must be called inside a tokio runtime.
    pub fn build(self) -> OpsResult<Node> {
        let network = NetworkConnectionService::new(self.identity, self.network_config);
        if self.broker {
            network.register_transport_provider(Arc::new(BrokerTransportProvider::new()))?;
        }
        if let Some(virtual_network) = self.virtual_network {
            network.register_transport_provider(Arc::new(VirtualTransportProvider::new(virtual_network)))?;
        }
        network.add_request_handler(Arc::new(HealthCheckRequestHandler));

        let contact_map = Arc::new(CommunicationContactMap::new());
        for (communication_type, line) in &self.contact_mappings {
            contact_map.load_mappings(*communication_type, [line]);
        }

        let routing = RoutingService::new(network.clone(), self.routing_config, contact_map);
        let registry = Arc::new(ServiceRegistry::new());
        for (service, properties) in self.services {
            registry.register(service, properties);
        }
        routing.add_destination_handler(Arc::new(HealthCheckRequestHandler));
        routing.add_destination_handler(Arc::new(PeerListingHandler::new(network.clone())));
        routing.add_destination_handler(Arc::new(ServiceCallHandler::new(registry.clone())));

        let communication = CommunicationService::new(routing.clone(), registry);

        Ok(Node {
            network,
            routing,
            communication,
            listen_on: self.listen_on,
            static_contacts: self.static_contacts,
            connect_delay: self.connect_delay,
        })
    }
}

/// One running peer.
pub struct Node {
    network: NetworkConnectionService,
    routing: RoutingService,
    communication: CommunicationService,
    listen_on: Vec<NetworkContactPoint>,
    static_contacts: Vec<NetworkContactPoint>,
    connect_delay: Duration,
}

impl Node {
    pub fn builder(identity: NodeIdentity) -> NodeBuilder {
        NodeBuilder::new(identity)
    }

    pub fn identity(&self) -> &NodeIdentity {
        self.network.local_identity()
    }

    pub fn network(&self) -> &NetworkConnectionService {
        &self.network
    }

    pub fn routing(&self) -> &RoutingService {
        &self.routing
    }

    pub fn communication(&self) -> &CommunicationService {
        &self.communication
    }

    pub fn static_contacts(&self) -> &[NetworkContactPoint] {
        &self.static_contacts
    }

    pub fn connect_delay(&self) -> Duration {
        self.connect_delay
    }

    /// Start the configured servers and health checks.
    ///
    /// Returns the effective contact points.
    pub async fn start(&self) -> OpsResult<Vec<NetworkContactPoint>> {
        let mut bound = Vec::with_capacity(self.listen_on.len());
        for contact_point in &self.listen_on {
            let effective = self.network.start_server(contact_point.clone()).await?;
            info!(node = %self.identity().id, contact = %effective, "Listening");
            bound.push(effective);
        }
        self.network.start_health_checks();
        Ok(bound)
    }

    /// Connect to every static contact, after the connect delay.
    ///
    /// Failures are logged and skipped; returns the identities reached.
    pub async fn connect_static_contacts(&self) -> Vec<NodeIdentity> {
        if self.static_contacts.is_empty() {
            return Vec::new();
        }
        tokio::time::sleep(self.connect_delay).await;

        let mut reached = Vec::new();
        for contact_point in &self.static_contacts {
            match self.network.connect(contact_point, true).await {
                Ok(connection) => {
                    if let Some(remote) = connection.remote() {
                        info!(peer = %remote.id, contact = %contact_point, "Connected to static contact");
                        reached.push(remote.clone());
                    }
                }
                Err(e) => {
                    warn!(contact = %contact_point, error = %e, "Could not connect to static contact");
                }
            }
        }
        reached
    }

    /// Stop background tasks and close all connections and servers.
    pub async fn shutdown(&self) {
        self.communication.shutdown();
        self.network.shutdown().await;
    }
}
