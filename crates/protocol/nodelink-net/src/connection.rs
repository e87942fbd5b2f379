//! Connections between two nodes.
//!
//! A [`Connection`] is one direction of communication: the side that owns
//! it sends requests and waits for responses. The initiator of a handshake
//! owns a self-initiated connection; with duplex enabled the responder owns
//! a matching remote-initiated one.
//!
//! # Lifecycle
//!
//! ```text
//! HandshakePending --attach_remote--> Open --close/broken--> Closed
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use nodelink_types::{keys, NetworkContactPoint, NetworkRequest, NetworkResponse, NodeId, NodeIdentity, ResultCode};
use nodelink_wire::{parse_response, request_message, shutdown_message};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::MessageChannel;
use crate::error::NetworkError;
use crate::event::{BrokenConnection, BrokenConnectionSink};
use crate::pool::WorkerPool;
use crate::traits::ConnectionEndpointHandler;
use crate::transport::TransportContext;

/// Failure text for requests that time out on a closed connection.
pub const TIMEOUT_AFTER_CLOSE_MESSAGE: &str = "Timeout after connection was already closed";

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of a connection, unique across the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap an id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates connection ids: a random per-factory prefix and a counter.
#[derive(Debug)]
pub struct ConnectionIdFactory {
    prefix: String,
    next: AtomicU64,
}

impl ConnectionIdFactory {
    /// Create a factory with a fresh random prefix.
    pub fn new() -> Self {
        Self {
            prefix: format!("{:08x}", rand::random::<u32>()),
            next: AtomicU64::new(1),
        }
    }

    /// Next connection id.
    pub fn next_id(&self) -> ConnectionId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        ConnectionId(format!("{}-{}", self.prefix, n))
    }
}

impl Default for ConnectionIdFactory {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Roles and State
// =============================================================================

/// Which side of the handshake created a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitiationRole {
    /// This node connected to the remote node's server.
    SelfInitiated,
    /// The remote node connected to this node's server.
    RemoteInitiated,
}

impl fmt::Display for InitiationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfInitiated => f.write_str("self-initiated"),
            Self::RemoteInitiated => f.write_str("remote-initiated"),
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, remote identity not yet known.
    HandshakePending,
    /// Usable.
    Open,
    /// Closed locally or declared broken.
    Closed,
}

/// How requests leave this node.
pub(crate) enum ConnectionTransport {
    /// Requests are queued on `outgoing_queue` through a broker channel.
    Broker {
        channel: Arc<dyn MessageChannel>,
        outgoing_queue: String,
    },
    /// Requests are handed to the peer's endpoint handler in-process.
    Virtual {
        peer: Arc<dyn ConnectionEndpointHandler>,
    },
}

impl ConnectionTransport {
    fn kind(&self) -> &'static str {
        match self {
            Self::Broker { .. } => "broker",
            Self::Virtual { .. } => "virtual",
        }
    }
}

/// What closing a connection does to the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseStrategy {
    /// Close the link this connection owns.
    CloseLink,
    /// Stop the remote consumer of the passive inbox with the shutdown token.
    SendPoisonPill,
    /// Nothing to release.
    Detach,
}

fn close_strategy(role: InitiationRole, transport: &ConnectionTransport) -> CloseStrategy {
    match (role, transport) {
        (_, ConnectionTransport::Virtual { .. }) => CloseStrategy::Detach,
        (InitiationRole::SelfInitiated, ConnectionTransport::Broker { .. }) => CloseStrategy::CloseLink,
        (InitiationRole::RemoteInitiated, ConnectionTransport::Broker { .. }) => {
            CloseStrategy::SendPoisonPill
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Everything a transport supplies to create a connection.
pub(crate) struct ConnectionSetup {
    pub id: ConnectionId,
    pub role: InitiationRole,
    pub local: NodeIdentity,
    pub transport: ConnectionTransport,
    pub shutdown_token: String,
    pub contact_point: Option<NetworkContactPoint>,
}

/// One direction of communication with a remote node.
pub struct Connection {
    id: ConnectionId,
    role: InitiationRole,
    local: NodeIdentity,
    remote: OnceLock<NodeIdentity>,
    transport: ConnectionTransport,
    shutdown_token: String,
    contact_point: Option<NetworkContactPoint>,
    message_ttl: Duration,
    pool: WorkerPool,
    broken_sink: BrokenConnectionSink,
    closed: AtomicBool,
    broken_reported: AtomicBool,
    in_flight: Mutex<HashMap<String, Instant>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("transport", &self.transport.kind())
            .field("remote", &self.remote.get().map(|r| r.id.as_str()))
            .field("state", &self.state())
            .finish()
    }
}

/// Removes a request from the in-flight table when dropped.
struct InFlightGuard<'a> {
    table: &'a Mutex<HashMap<String, Instant>>,
    request_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.request_id);
    }
}

impl Connection {
    pub(crate) fn new(setup: ConnectionSetup, context: &TransportContext) -> Arc<Self> {
        Arc::new(Self {
            id: setup.id,
            role: setup.role,
            local: setup.local,
            remote: OnceLock::new(),
            transport: setup.transport,
            shutdown_token: setup.shutdown_token,
            contact_point: setup.contact_point,
            message_ttl: context.config.message_ttl,
            pool: context.pool.clone(),
            broken_sink: context.broken.clone(),
            closed: AtomicBool::new(false),
            broken_reported: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Record the remote identity learned in the handshake.
    pub(crate) fn attach_remote(&self, remote: NodeIdentity) {
        if self.remote.set(remote).is_err() {
            warn!(connection = %self.id, "Remote identity already attached");
        }
    }

    /// Tie a background task to this connection; it is aborted on close.
    pub(crate) fn attach_task(&self, task: JoinHandle<()>) {
        self.tasks().push(task);
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Which side initiated the connection.
    pub fn role(&self) -> InitiationRole {
        self.role
    }

    /// Whether this node initiated the connection.
    pub fn is_self_initiated(&self) -> bool {
        self.role == InitiationRole::SelfInitiated
    }

    /// Local identity presented in the handshake.
    pub fn local(&self) -> &NodeIdentity {
        &self.local
    }

    /// Remote identity, once the handshake completed.
    pub fn remote(&self) -> Option<&NodeIdentity> {
        self.remote.get()
    }

    /// Remote node id, once the handshake completed.
    pub fn remote_id(&self) -> Option<&NodeId> {
        self.remote.get().map(|r| &r.id)
    }

    /// Contact point this connection was opened to, for self-initiated connections.
    pub fn contact_point(&self) -> Option<&NetworkContactPoint> {
        self.contact_point.as_ref()
    }

    /// Transport kind, `"broker"` or `"virtual"`.
    pub fn transport_kind(&self) -> &'static str {
        self.transport.kind()
    }

    /// Shutdown token agreed in the handshake.
    pub(crate) fn shutdown_token(&self) -> &str {
        &self.shutdown_token
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            ConnectionState::Closed
        } else if self.remote.get().is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::HandshakePending
        }
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn track(&self, request_id: &str) -> InFlightGuard<'_> {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.to_string(), Instant::now());
        InFlightGuard {
            table: &self.in_flight,
            request_id: request_id.to_string(),
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// Never fails: transport problems, timeouts and remote errors all come
    /// back as a failure response with the matching result code. The
    /// `sender` metadata is set to the local node id unless already present.
    pub async fn request(&self, request: NetworkRequest, timeout: Duration) -> NetworkResponse {
        let request = if request.get(keys::SENDER).is_none() {
            request.with_metadata(keys::SENDER, self.local.id.as_str())
        } else {
            request
        };

        if self.is_closed() {
            return NetworkResponse::failure(
                &request,
                ResultCode::ConnectionBroken,
                format!("Connection {} is closed", self.id),
            );
        }

        let _guard = self.track(request.request_id());
        match &self.transport {
            ConnectionTransport::Broker {
                channel,
                outgoing_queue,
            } => {
                self.request_via_broker(channel.as_ref(), outgoing_queue, request, timeout)
                    .await
            }
            ConnectionTransport::Virtual { peer } => {
                self.request_via_peer(Arc::clone(peer), request, timeout).await
            }
        }
    }

    /// Send a request without waiting; `on_response` runs exactly once on the worker pool.
    pub fn send_request<F>(self: &Arc<Self>, request: NetworkRequest, timeout: Duration, on_response: F)
    where
        F: FnOnce(NetworkResponse) + Send + 'static,
    {
        let connection = Arc::clone(self);
        self.pool.spawn(async move {
            let response = connection.request(request, timeout).await;
            on_response(response);
        });
    }

    async fn request_via_broker(
        &self,
        channel: &dyn MessageChannel,
        outgoing_queue: &str,
        request: NetworkRequest,
        timeout: Duration,
    ) -> NetworkResponse {
        let reply_queue = match channel.create_temporary_queue().await {
            Ok(queue) => queue,
            Err(e) => return self.transport_failure(&request, e),
        };

        let message = request_message(&request, outgoing_queue, &reply_queue).with_ttl(self.message_ttl);
        let outcome = match channel.send(message).await {
            Ok(()) => channel.receive(&reply_queue, timeout).await,
            Err(e) => Err(e),
        };

        if let Err(e) = channel.delete_queue(&reply_queue).await {
            debug!(connection = %self.id, queue = %reply_queue, error = %e, "Could not delete reply queue");
        }

        match outcome {
            Ok(Some(reply)) => match parse_response(&reply) {
                Ok(response) if response.request_id() == request.request_id() => response,
                Ok(response) => NetworkResponse::failure(
                    &request,
                    ResultCode::ProtocolError,
                    format!("Response for request {} delivered to request {}", response.request_id(), request.request_id()),
                ),
                Err(e) => NetworkResponse::failure(&request, ResultCode::ProtocolError, e),
            },
            Ok(None) => self.timeout_response(&request, timeout),
            Err(e) => self.transport_failure(&request, e),
        }
    }

    async fn request_via_peer(
        &self,
        peer: Arc<dyn ConnectionEndpointHandler>,
        request: NetworkRequest,
        timeout: Duration,
    ) -> NetworkResponse {
        // The receiving side gets its own copy; nothing is shared by reference.
        let detached = request.clone();
        let sender = self.local.id.clone();
        let handle = self
            .pool
            .spawn(async move { peer.on_raw_request_received(detached, sender).await });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => NetworkResponse::failure(
                &request,
                ResultCode::ExceptionAtDestination,
                format!("Request handling aborted: {}", e),
            ),
            Err(_) => self.timeout_response(&request, timeout),
        }
    }

    fn timeout_response(&self, request: &NetworkRequest, timeout: Duration) -> NetworkResponse {
        if self.is_closed() {
            NetworkResponse::failure(request, ResultCode::TimeoutAfterClose, TIMEOUT_AFTER_CLOSE_MESSAGE)
        } else {
            NetworkResponse::failure(
                request,
                ResultCode::Timeout,
                format!("No response within {} ms", timeout.as_millis()),
            )
        }
    }

    fn transport_failure(&self, request: &NetworkRequest, error: NetworkError) -> NetworkResponse {
        if self.is_closed() {
            return NetworkResponse::failure(request, ResultCode::TimeoutAfterClose, TIMEOUT_AFTER_CLOSE_MESSAGE);
        }
        if error.is_timeout() {
            return NetworkResponse::failure(request, ResultCode::Timeout, error);
        }
        if error.is_link_failure() {
            self.report_broken(error.to_string());
            return NetworkResponse::failure(request, ResultCode::ConnectionBroken, error);
        }
        NetworkResponse::failure(request, ResultCode::ProtocolError, error)
    }

    // =========================================================================
    // Close and Failure
    // =========================================================================

    /// Close the connection. Idempotent.
    ///
    /// A self-initiated broker connection closes its link. A remote-initiated
    /// one sends a poison pill carrying the shutdown token to the passive
    /// inbox, stopping the initiator's consumer without touching the shared
    /// broker session.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        match (close_strategy(self.role, &self.transport), &self.transport) {
            (CloseStrategy::CloseLink, ConnectionTransport::Broker { channel, .. }) => {
                channel.close().await;
            }
            (
                CloseStrategy::SendPoisonPill,
                ConnectionTransport::Broker {
                    channel,
                    outgoing_queue,
                },
            ) => {
                let pill = shutdown_message(outgoing_queue, &self.shutdown_token).with_ttl(self.message_ttl);
                if let Err(e) = channel.send(pill).await {
                    debug!(connection = %self.id, error = %e, "Could not deliver shutdown message");
                }
            }
            _ => {}
        }

        for task in self.tasks().drain(..) {
            task.abort();
        }

        info!(
            connection = %self.id,
            role = %self.role,
            remote = ?self.remote_id().map(NodeId::as_str),
            "Connection closed"
        );
    }

    /// Report that the underlying link failed.
    ///
    /// Only the first report is forwarded, and none after a local close.
    pub fn report_broken(&self, reason: impl Into<String>) {
        if self.is_closed() || self.broken_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = reason.into();
        warn!(connection = %self.id, reason = %reason, "Connection broken");
        let _ = self.broken_sink.send(BrokenConnection {
            connection_id: self.id.clone(),
            role: self.role,
            remote: self.remote_id().cloned(),
            reason,
        });
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{LocalSession, MessageBroker};
    use crate::config::NetworkConfig;
    use async_trait::async_trait;
    use nodelink_wire::{parse_request, response_message, shutdown_token, REQUEST_INBOX};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn identity(id: &str) -> NodeIdentity {
        NodeIdentity::new(NodeId::new(id).unwrap(), id.to_uppercase())
    }

    fn context() -> (TransportContext, mpsc::UnboundedReceiver<BrokenConnection>) {
        TransportContext::new(NetworkConfig::default())
    }

    struct Echo {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl ConnectionEndpointHandler for Echo {
        fn exchange_node_information(&self, _remote: &NodeIdentity) -> NodeIdentity {
            identity("bbb")
        }

        async fn on_remote_initiated_connection_established(
            &self,
            _connection: Arc<Connection>,
            _contact_point: &crate::transport::ServerContactPoint,
        ) {
        }

        async fn on_raw_request_received(&self, request: NetworkRequest, sender: NodeId) -> NetworkResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let mut body = sender.as_str().as_bytes().to_vec();
            body.extend_from_slice(request.content());
            NetworkResponse::success(&request, body)
        }
    }

    fn virtual_connection(delay: Duration) -> (Arc<Connection>, Arc<Echo>, mpsc::UnboundedReceiver<BrokenConnection>) {
        let (ctx, broken) = context();
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
            delay,
        });
        let connection = Connection::new(
            ConnectionSetup {
                id: ctx.ids.next_id(),
                role: InitiationRole::SelfInitiated,
                local: identity("aaa"),
                transport: ConnectionTransport::Virtual { peer: echo.clone() },
                shutdown_token: "t".into(),
                contact_point: None,
            },
            &ctx,
        );
        connection.attach_remote(identity("bbb"));
        (connection, echo, broken)
    }

    #[test]
    fn test_connection_ids_unique() {
        let a = ConnectionIdFactory::new();
        let b = ConnectionIdFactory::new();
        let first = a.next_id();
        assert_ne!(first, a.next_id());
        assert_ne!(first, b.next_id());
    }

    #[test]
    fn test_close_strategy_by_role() {
        let broker = Arc::new(MessageBroker::new());
        let broker_transport = ConnectionTransport::Broker {
            channel: Arc::new(LocalSession::new(broker)),
            outgoing_queue: REQUEST_INBOX.into(),
        };
        assert_eq!(
            close_strategy(InitiationRole::SelfInitiated, &broker_transport),
            CloseStrategy::CloseLink
        );
        assert_eq!(
            close_strategy(InitiationRole::RemoteInitiated, &broker_transport),
            CloseStrategy::SendPoisonPill
        );
    }

    #[tokio::test]
    async fn test_request_stamps_sender() {
        let (connection, echo, _broken) = virtual_connection(Duration::ZERO);
        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(connection.transport_kind(), "virtual");

        let response = connection
            .request(NetworkRequest::new(b"-ping".to_vec(), Default::default()), Duration::from_secs(1))
            .await;
        assert!(response.is_success());
        assert_eq!(response.content(), b"aaa-ping");
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
        assert_eq!(connection.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_timeout_before_and_after_close() {
        let (connection, _echo, _broken) = virtual_connection(Duration::from_millis(200));

        let response = connection
            .request(NetworkRequest::new(vec![], Default::default()), Duration::from_millis(20))
            .await;
        assert_eq!(response.result_code(), ResultCode::Timeout);

        let pending = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection
                    .request(NetworkRequest::new(vec![], Default::default()), Duration::from_millis(100))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        connection.close().await;

        let response = pending.await.unwrap();
        assert_eq!(response.result_code(), ResultCode::TimeoutAfterClose);
        assert_eq!(response.error_message(), Some(TIMEOUT_AFTER_CLOSE_MESSAGE));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_request_invokes_handler_once() {
        let (connection, _echo, _broken) = virtual_connection(Duration::ZERO);
        let (tx, mut rx) = mpsc::unbounded_channel();

        connection.send_request(
            NetworkRequest::new(b"x".to_vec(), Default::default()),
            Duration::from_secs(1),
            move |response| {
                let _ = tx.send(response);
            },
        );

        let response = rx.recv().await.unwrap();
        assert!(response.is_success());
        // The handler consumed its sender, so the channel closes after one response.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_report_broken_at_most_once() {
        let (connection, _echo, mut broken) = virtual_connection(Duration::ZERO);

        connection.report_broken("first");
        connection.report_broken("second");

        let report = broken.recv().await.unwrap();
        assert_eq!(report.reason, "first");
        assert_eq!(report.connection_id, *connection.id());
        assert!(broken.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_broken_report_after_close() {
        let (connection, _echo, mut broken) = virtual_connection(Duration::ZERO);
        connection.close().await;
        connection.report_broken("late");
        assert!(broken.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broker_request_and_remote_initiated_close() {
        let (ctx, _broken) = context();
        let broker = Arc::new(MessageBroker::new());
        let responder = LocalSession::new(Arc::clone(&broker));
        let session: Arc<dyn MessageChannel> = Arc::new(LocalSession::new(Arc::clone(&broker)));

        let connection = Connection::new(
            ConnectionSetup {
                id: ctx.ids.next_id(),
                role: InitiationRole::RemoteInitiated,
                local: identity("bbb"),
                transport: ConnectionTransport::Broker {
                    channel: Arc::clone(&session),
                    outgoing_queue: "passive.q".into(),
                },
                shutdown_token: "secret".into(),
                contact_point: None,
            },
            &ctx,
        );
        connection.attach_remote(identity("aaa"));

        // Answer one request by hand.
        let answer = tokio::spawn(async move {
            let message = responder
                .receive("passive.q", Duration::from_secs(2))
                .await
                .unwrap()
                .unwrap();
            let request = parse_request(&message).unwrap();
            assert_eq!(request.sender().unwrap().as_str(), "bbb");
            let reply = response_message(&NetworkResponse::success(&request, b"pong".to_vec()), message.reply_to.as_deref().unwrap());
            responder.send(reply).await.unwrap();
            responder
        });

        let response = connection
            .request(NetworkRequest::new(b"ping".to_vec(), Default::default()), Duration::from_secs(2))
            .await;
        assert!(response.is_success());
        assert_eq!(response.content(), b"pong");
        let responder = answer.await.unwrap();
        assert_eq!(broker.temporary_queue_count(), 0);

        connection.close().await;
        let pill = responder
            .receive("passive.q", Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shutdown_token(&pill).as_deref(), Some("secret"));
        // The shared session stays usable.
        assert!(!session.is_closed());
    }
}
