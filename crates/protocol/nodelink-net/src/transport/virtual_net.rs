//! In-process transport.
//!
//! Servers register on a shared [`VirtualNetwork`]; connecting looks the
//! server up by contact point and exchanges identities directly. Requests
//! are copied and dispatched on the worker pool, so the two sides never
//! share a request or response by reference.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use nodelink_types::{NetworkContactPoint, NodeIdentity};
use nodelink_wire::{generate_shutdown_token, REJECT_NOT_ACCEPTING, REJECT_SAME_NODE_ID};
use tracing::{debug, info};

use super::{ServerContactPoint, TransportContext};
use crate::connection::{Connection, ConnectionSetup, ConnectionTransport, InitiationRole};
use crate::error::{NetworkError, NetworkResult};
use crate::traits::{ConnectionEndpointHandler, TransportProvider};

/// Transport id of the in-process transport.
pub const VIRTUAL_TRANSPORT_ID: &str = "virtual";

/// Registry of in-process servers, shared by every node of one test network.
#[derive(Clone, Default)]
pub struct VirtualNetwork {
    servers: Arc<RwLock<HashMap<String, Arc<ServerContactPoint>>>>,
}

impl VirtualNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, contact_point: &NetworkContactPoint) -> Option<Arc<ServerContactPoint>> {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&contact_point.endpoint_key())
            .cloned()
    }

    /// Number of registered servers.
    pub fn server_count(&self) -> usize {
        self.servers.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Transport provider for a [`VirtualNetwork`].
pub struct VirtualTransportProvider {
    network: VirtualNetwork,
    duplex: bool,
    registered: Mutex<HashSet<String>>,
}

impl VirtualTransportProvider {
    /// Create a provider attached to `network`.
    pub fn new(network: VirtualNetwork) -> Self {
        Self {
            network,
            duplex: true,
            registered: Mutex::new(HashSet::new()),
        }
    }

    /// Disable connections back to the initiator.
    pub fn without_duplex(mut self) -> Self {
        self.duplex = false;
        self
    }
}

#[async_trait]
impl TransportProvider for VirtualTransportProvider {
    fn transport_id(&self) -> &str {
        VIRTUAL_TRANSPORT_ID
    }

    fn supports_remote_initiated_connections(&self) -> bool {
        self.duplex
    }

    async fn start_server(&self, contact_point: Arc<ServerContactPoint>) -> NetworkResult<NetworkContactPoint> {
        let key = contact_point.contact_point().endpoint_key();
        let mut servers = self.network.servers.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = servers.get(&key) {
            if Arc::ptr_eq(existing, &contact_point) || existing.local().id == contact_point.local().id {
                // Restarting a stopped server re-opens it.
                existing.set_accepting(true);
                return Ok(existing.contact_point().clone());
            }
            return Err(NetworkError::AlreadyListening(key));
        }

        let bound = contact_point.contact_point().clone();
        contact_point.set_bound(bound.clone());
        contact_point.set_accepting(true);
        servers.insert(key.clone(), Arc::clone(&contact_point));
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
        info!(contact_point = %bound, node = %contact_point.local().id, "Virtual server started");
        Ok(bound)
    }

    async fn stop_server(&self, contact_point: &ServerContactPoint) -> NetworkResult<()> {
        if let Some(server) = self.network.lookup(contact_point.contact_point()) {
            server.set_accepting(false);
            info!(contact_point = %contact_point.contact_point(), "Virtual server stopped accepting connections");
        }
        Ok(())
    }

    async fn connect(
        &self,
        contact_point: &NetworkContactPoint,
        local: &NodeIdentity,
        allow_duplex: bool,
        handler: Arc<dyn ConnectionEndpointHandler>,
        context: &TransportContext,
    ) -> NetworkResult<Arc<Connection>> {
        let server = self
            .network
            .lookup(contact_point)
            .ok_or_else(|| NetworkError::ConnectFailed(format!("no virtual server at {}", contact_point)))?;

        if !server.is_accepting() {
            return Err(NetworkError::HandshakeRejected(REJECT_NOT_ACCEPTING.into()));
        }
        if server.local().id == local.id {
            return Err(NetworkError::ProtocolViolation(REJECT_SAME_NODE_ID.into()));
        }

        let remote_handler = server.handler();
        let remote = remote_handler.exchange_node_information(local);
        if remote.id == local.id {
            return Err(NetworkError::ProtocolViolation(REJECT_SAME_NODE_ID.into()));
        }

        let token = generate_shutdown_token();
        let connection = Connection::new(
            ConnectionSetup {
                id: context.ids.next_id(),
                role: InitiationRole::SelfInitiated,
                local: local.clone(),
                transport: ConnectionTransport::Virtual {
                    peer: Arc::clone(&remote_handler),
                },
                shutdown_token: token.clone(),
                contact_point: Some(contact_point.clone()),
            },
            context,
        );
        connection.attach_remote(remote.clone());

        if allow_duplex && self.duplex {
            let server_context = server.context();
            let passive = Connection::new(
                ConnectionSetup {
                    id: server_context.ids.next_id(),
                    role: InitiationRole::RemoteInitiated,
                    local: remote.clone(),
                    transport: ConnectionTransport::Virtual { peer: handler },
                    shutdown_token: token,
                    contact_point: None,
                },
                server_context,
            );
            passive.attach_remote(local.clone());
            remote_handler
                .on_remote_initiated_connection_established(passive, &server)
                .await;
        }

        debug!(
            connection = %connection.id(),
            remote = %remote.id,
            duplex = allow_duplex && self.duplex,
            "Virtual connection established"
        );
        Ok(connection)
    }

    async fn shutdown(&self) {
        let registered: Vec<String> = self
            .registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        let mut servers = self.network.servers.write().unwrap_or_else(|e| e.into_inner());
        for key in registered {
            if let Some(server) = servers.remove(&key) {
                server.set_accepting(false);
            }
        }
    }
}
