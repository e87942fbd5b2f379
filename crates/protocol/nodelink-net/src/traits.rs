//! Extension points of the network layer.
//!
//! This module defines the traits the connection service and its
//! transports are built from:
//! - [`TransportProvider`] - one way of reaching other nodes
//! - [`ConnectionEndpointHandler`] - what a node does when it is reached
//! - [`RequestHandler`] - one entry in the request dispatch chain

use std::sync::Arc;

use async_trait::async_trait;
use nodelink_types::{NetworkContactPoint, NetworkRequest, NetworkResponse, NodeId, NodeIdentity};

use crate::connection::Connection;
use crate::error::NetworkResult;
use crate::transport::{ServerContactPoint, TransportContext};

/// A transport able to serve and open connections.
///
/// Providers are identified by [`transport_id`](Self::transport_id), which
/// matches the `transport_id` of the contact points they handle.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Transport id handled by this provider.
    fn transport_id(&self) -> &str;

    /// Whether servers of this transport can open connections back to the initiator.
    fn supports_remote_initiated_connections(&self) -> bool;

    // =========================================================================
    // Server Side
    // =========================================================================

    /// Start serving `contact_point`.
    ///
    /// Returns the effective contact point, which differs from the requested
    /// one when port 0 was asked for. Starting an already started contact
    /// point is a no-op.
    async fn start_server(&self, contact_point: Arc<ServerContactPoint>) -> NetworkResult<NetworkContactPoint>;

    /// Stop accepting handshakes on `contact_point`.
    ///
    /// Established connections are not terminated.
    async fn stop_server(&self, contact_point: &ServerContactPoint) -> NetworkResult<()>;

    // =========================================================================
    // Client Side
    // =========================================================================

    /// Open a connection to `contact_point` and run the handshake.
    ///
    /// With `allow_duplex` the remote side gets a connection back to this
    /// node; its requests are dispatched to `handler`.
    async fn connect(
        &self,
        contact_point: &NetworkContactPoint,
        local: &NodeIdentity,
        allow_duplex: bool,
        handler: Arc<dyn ConnectionEndpointHandler>,
        context: &TransportContext,
    ) -> NetworkResult<Arc<Connection>>;

    /// Release every server and link this provider holds.
    async fn shutdown(&self) {}
}

/// Callbacks a node exposes to its transports.
#[async_trait]
pub trait ConnectionEndpointHandler: Send + Sync {
    /// Learn about a remote node during a handshake and return the local identity.
    fn exchange_node_information(&self, remote: &NodeIdentity) -> NodeIdentity;

    /// A remote node completed a handshake against one of our servers.
    async fn on_remote_initiated_connection_established(
        &self,
        connection: Arc<Connection>,
        contact_point: &ServerContactPoint,
    );

    /// The initiator of a remote-initiated connection went away.
    ///
    /// Transports that cannot observe this never call it.
    async fn on_remote_initiated_connection_lost(&self, _connection: Arc<Connection>) {}

    /// A request arrived from `sender`.
    async fn on_raw_request_received(&self, request: NetworkRequest, sender: NodeId) -> NetworkResponse;
}

/// One entry of the request dispatch chain.
///
/// Handlers are consulted in registration order; the first applicable
/// one handles the request. Errors become `ExceptionAtDestination`
/// responses.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Whether this handler takes `request`.
    fn is_applicable(&self, request: &NetworkRequest) -> bool;

    /// Handle `request` from `sender`.
    async fn handle(&self, request: &NetworkRequest, sender: &NodeId) -> anyhow::Result<NetworkResponse>;
}
