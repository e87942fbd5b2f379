//! Local services and remote service calls.
//!
//! Services are registered under a name with string properties. A call to a
//! service on another node travels as an `rpc` request carrying a CBOR
//! encoded [`ServiceCall`]; the destination looks the service up in its own
//! registry and answers with the raw result bytes.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use nodelink_net::RequestHandler;
use nodelink_types::{categories, NetworkRequest, NetworkResponse, NodeId, ResultCode};
use nodelink_wire::{decode_payload, encode_payload};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{OpsError, OpsResult};
use crate::routing::RoutingService;

/// String properties attached to a service registration.
pub type ServiceProperties = BTreeMap<String, String>;

/// A callable service.
#[async_trait]
pub trait Service: Send + Sync {
    /// Name the service is registered under.
    fn name(&self) -> &str;

    /// Invoke `method` with an opaque payload.
    async fn invoke(&self, method: &str, payload: &[u8]) -> OpsResult<Vec<u8>>;
}

// =============================================================================
// Registry
// =============================================================================

struct Registration {
    name: String,
    properties: ServiceProperties,
    service: Arc<dyn Service>,
}

impl Registration {
    fn matches(&self, name: &str, properties: &ServiceProperties) -> bool {
        self.name == name && properties.iter().all(|(k, v)| self.properties.get(k) == Some(v))
    }
}

/// Services offered by the local node.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<Vec<Registration>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` under its name with `properties`.
    pub fn register(&self, service: Arc<dyn Service>, properties: ServiceProperties) {
        let name = service.name().to_string();
        info!(service = %name, ?properties, "Service registered");
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Registration {
                name,
                properties,
                service,
            });
    }

    /// Remove every registration under `name`. Returns how many were removed.
    pub fn unregister(&self, name: &str) -> usize {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        let before = services.len();
        services.retain(|r| r.name != name);
        before - services.len()
    }

    /// First service registered under `name` whose properties include all of `properties`.
    pub fn find(&self, name: &str, properties: &ServiceProperties) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.matches(name, properties))
            .map(|r| r.service.clone())
    }

    /// Registered service names, sorted and deduplicated.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

// =============================================================================
// Remote Calls
// =============================================================================

/// Payload of an `rpc` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub service: String,
    #[serde(default)]
    pub properties: ServiceProperties,
    pub method: String,
    pub payload: Vec<u8>,
}

impl ServiceCall {
    pub fn to_request(&self) -> OpsResult<NetworkRequest> {
        Ok(NetworkRequest::builder()
            .category(categories::RPC)
            .metadata(nodelink_types::keys::METHOD, self.method.clone())
            .content(encode_payload(self)?)
            .build())
    }
}

/// Answers `rpc` requests from the local registry.
pub struct ServiceCallHandler {
    registry: Arc<ServiceRegistry>,
}

impl ServiceCallHandler {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RequestHandler for ServiceCallHandler {
    fn is_applicable(&self, request: &NetworkRequest) -> bool {
        request.category() == Some(categories::RPC)
    }

    async fn handle(&self, request: &NetworkRequest, sender: &NodeId) -> anyhow::Result<NetworkResponse> {
        let call: ServiceCall = match decode_payload(request.content()) {
            Ok(call) => call,
            Err(e) => return Ok(NetworkResponse::failure(request, ResultCode::ProtocolError, e)),
        };
        debug!(service = %call.service, method = %call.method, sender = %sender, "Service call");

        let Some(service) = self.registry.find(&call.service, &call.properties) else {
            return Ok(NetworkResponse::failure(
                request,
                ResultCode::NoMatchingHandler,
                OpsError::ServiceNotAvailable(call.service),
            ));
        };
        let result = service.invoke(&call.method, &call.payload).await?;
        Ok(NetworkResponse::success(request, result))
    }
}

/// A service on another node, called through routed requests.
pub struct RemoteServiceProxy {
    routing: RoutingService,
    target: NodeId,
    service: String,
    properties: ServiceProperties,
    timeout: Duration,
}

impl RemoteServiceProxy {
    pub fn new(
        routing: RoutingService,
        target: NodeId,
        service: impl Into<String>,
        properties: ServiceProperties,
        timeout: Duration,
    ) -> Self {
        Self {
            routing,
            target,
            service: service.into(),
            properties,
            timeout,
        }
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Service for RemoteServiceProxy {
    fn name(&self) -> &str {
        &self.service
    }

    async fn invoke(&self, method: &str, payload: &[u8]) -> OpsResult<Vec<u8>> {
        let call = ServiceCall {
            service: self.service.clone(),
            properties: self.properties.clone(),
            method: method.to_string(),
            payload: payload.to_vec(),
        };
        let response = self
            .routing
            .send_routed(call.to_request()?, &self.target, self.timeout)
            .await;

        match response.result_code() {
            ResultCode::Success => Ok(response.into_content()),
            ResultCode::NoMatchingHandler => Err(OpsError::ServiceNotAvailable(format!(
                "{} at {}",
                self.service, self.target
            ))),
            code => Err(OpsError::Remote {
                code,
                message: response.error_message().unwrap_or_default().to_string(),
            }),
        }
    }
}
