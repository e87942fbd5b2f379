//! Spy handlers that record what they receive.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nodelink_net::{Connection, ConnectionEndpointHandler, RequestHandler, ServerContactPoint};
use nodelink_types::{NetworkRequest, NetworkResponse, NodeId, NodeIdentity};

/// Request handler that records every request and echoes its content.
///
/// Cheap to clone; clones share the record.
#[derive(Clone, Default)]
pub struct RecordingRequestHandler {
    category: Option<String>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<(NetworkRequest, NodeId)>>>,
}

impl RecordingRequestHandler {
    /// Handle every request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle only requests of `category`.
    pub fn for_category(category: &str) -> Self {
        Self {
            category: Some(category.to_string()),
            ..Self::default()
        }
    }

    /// Sleep for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Recorded `(request, sender)` pairs in arrival order.
    pub fn calls(&self) -> Vec<(NetworkRequest, NodeId)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Senders in arrival order.
    pub fn senders(&self) -> Vec<NodeId> {
        self.calls.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
    }
}

#[async_trait]
impl RequestHandler for RecordingRequestHandler {
    fn is_applicable(&self, request: &NetworkRequest) -> bool {
        match &self.category {
            Some(category) => request.category() == Some(category.as_str()),
            None => true,
        }
    }

    async fn handle(&self, request: &NetworkRequest, sender: &NodeId) -> anyhow::Result<NetworkResponse> {
        self.calls.lock().unwrap().push((request.clone(), sender.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(NetworkResponse::success(request, request.content().to_vec()))
    }
}

/// Endpoint handler that records handshakes, connections and requests.
///
/// Requests are answered by echoing their content.
#[derive(Clone)]
pub struct RecordingEndpointHandler {
    local: NodeIdentity,
    exchanged: Arc<Mutex<Vec<NodeIdentity>>>,
    connections: Arc<Mutex<Vec<Arc<Connection>>>>,
    requests: Arc<Mutex<Vec<(NetworkRequest, NodeId)>>>,
}

impl RecordingEndpointHandler {
    pub fn new(local: NodeIdentity) -> Self {
        Self {
            local,
            exchanged: Arc::default(),
            connections: Arc::default(),
            requests: Arc::default(),
        }
    }

    /// Identities received in handshakes.
    pub fn exchanged(&self) -> Vec<NodeIdentity> {
        self.exchanged.lock().unwrap().clone()
    }

    /// Remote-initiated connections reported so far.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().unwrap().clone()
    }

    /// Requests received with their senders.
    pub fn requests(&self) -> Vec<(NetworkRequest, NodeId)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionEndpointHandler for RecordingEndpointHandler {
    fn exchange_node_information(&self, remote: &NodeIdentity) -> NodeIdentity {
        self.exchanged.lock().unwrap().push(remote.clone());
        self.local.clone()
    }

    async fn on_remote_initiated_connection_established(
        &self,
        connection: Arc<Connection>,
        _contact_point: &ServerContactPoint,
    ) {
        self.connections.lock().unwrap().push(connection);
    }

    async fn on_raw_request_received(&self, request: NetworkRequest, sender: NodeId) -> NetworkResponse {
        self.requests.lock().unwrap().push((request.clone(), sender));
        NetworkResponse::success(&request, request.content().to_vec())
    }
}
