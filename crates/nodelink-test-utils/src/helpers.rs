//! Helper functions for creating test fixtures.
//!
//! Provides identities, requests, connection services wired to a shared
//! [`VirtualNetwork`], and a polling helper for eventually-true conditions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nodelink_net::{
    BrokerTransportProvider, HealthCheckConfig, HealthCheckRequestHandler, NetworkConfig, NetworkConnectionService,
    VirtualNetwork, VirtualTransportProvider,
};
use nodelink_types::{categories, NetworkContactPoint, NetworkRequest, NodeId, NodeIdentity};

/// Identity with the given id and its upper-cased id as display name.
pub fn test_identity(id: &str) -> NodeIdentity {
    NodeIdentity::new(NodeId::new(id).unwrap(), id.to_uppercase())
}

/// Identity of a workflow host.
pub fn test_host_identity(id: &str) -> NodeIdentity {
    test_identity(id).with_workflow_host(true)
}

/// An `rpc` request carrying `marker` as content.
pub fn test_request(marker: &str) -> NetworkRequest {
    NetworkRequest::builder()
        .category(categories::RPC)
        .content(marker.as_bytes().to_vec())
        .build()
}

/// Network configuration with short timeouts and health checks off.
pub fn test_network_config() -> NetworkConfig {
    NetworkConfig::default()
        .with_handshake_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_secs(5))
        .with_consumer_poll_interval(Duration::from_millis(50))
        .with_health_check(HealthCheckConfig::disabled())
}

/// Virtual contact point named after `host`.
pub fn virtual_contact(host: &str) -> NetworkContactPoint {
    NetworkContactPoint::new("virtual", host, 1)
}

/// Broker contact point on loopback with an ephemeral port.
pub fn loopback_broker_contact() -> NetworkContactPoint {
    NetworkContactPoint::new("broker", "127.0.0.1", 0)
}

/// Connection service on `network` that answers health checks.
pub fn virtual_service(identity: NodeIdentity, network: &VirtualNetwork) -> NetworkConnectionService {
    let service = NetworkConnectionService::new(identity, test_network_config());
    service
        .register_transport_provider(Arc::new(VirtualTransportProvider::new(network.clone())))
        .unwrap();
    service.add_request_handler(Arc::new(HealthCheckRequestHandler));
    service
}

/// Connection service with the broker transport that answers health checks.
pub fn broker_service(identity: NodeIdentity) -> NetworkConnectionService {
    let service = NetworkConnectionService::new(identity, test_network_config());
    service
        .register_transport_provider(Arc::new(BrokerTransportProvider::new()))
        .unwrap();
    service.add_request_handler(Arc::new(HealthCheckRequestHandler));
    service
}

/// Poll `condition` every 10 ms until it holds or `timeout` elapses.
///
/// Returns whether the condition held.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
