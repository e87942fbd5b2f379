//! Broker transport.
//!
//! Each served contact point runs an embedded [`MessageBroker`] behind a
//! TCP [`BrokerServer`], plus two consumers on a local session: one on
//! [`INITIAL_INBOX`] answering handshakes, one on [`REQUEST_INBOX`]
//! dispatching requests from initiators.
//!
//! An initiator opens a [`BrokerLink`], sends its identity to the initial
//! inbox and receives the responder's identity, the active inbox to send
//! requests to, the passive inbox on which the responder sends requests
//! back, and the shutdown token guarding the passive inbox consumer.
//!
//! The initiator keeps its handshake reply queue for the lifetime of the
//! link. The server deletes a link's temporary queues when the link ends,
//! which is how the responder learns that the initiator went away.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use nodelink_types::{NetworkContactPoint, NodeIdentity};
use nodelink_wire::{
    generate_shutdown_token, handshake_rejection, handshake_reply, initial_message,
    parse_handshake_reply, parse_initial, passive_request_inbox, shutdown_message, DecodeError,
    Envelope, HandshakeResponse, INITIAL_INBOX, REJECT_NOT_ACCEPTING, REJECT_SAME_NODE_ID,
    REQUEST_INBOX,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ServerContactPoint, TransportContext};
use crate::broker::{BrokerLink, BrokerServer, LocalSession, MessageBroker, MessageChannel};
use crate::connection::{Connection, ConnectionSetup, ConnectionTransport, InitiationRole};
use crate::consumer::{EnvelopeDispatcher, InboxConsumer, RequestDispatcher};
use crate::error::{NetworkError, NetworkResult};
use crate::traits::{ConnectionEndpointHandler, TransportProvider};

/// Transport id of the broker transport.
pub const BROKER_TRANSPORT_ID: &str = "broker";

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct RunningServer {
    contact_point: Arc<ServerContactPoint>,
    bound: NetworkContactPoint,
    broker: Arc<MessageBroker>,
    server: BrokerServer,
    session: Arc<LocalSession>,
    consumer_token: String,
    sweeper: JoinHandle<()>,
}

/// Transport provider for the TCP broker transport.
#[derive(Default)]
pub struct BrokerTransportProvider {
    servers: Mutex<HashMap<String, RunningServer>>,
    retired: Mutex<Vec<RunningServer>>,
}

impl BrokerTransportProvider {
    /// Create a provider with no running servers.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransportProvider for BrokerTransportProvider {
    fn transport_id(&self) -> &str {
        BROKER_TRANSPORT_ID
    }

    fn supports_remote_initiated_connections(&self) -> bool {
        true
    }

    async fn start_server(&self, contact_point: Arc<ServerContactPoint>) -> NetworkResult<NetworkContactPoint> {
        let key = contact_point.contact_point().endpoint_key();
        let mut servers = self.servers.lock().await;
        if let Some(running) = servers.get(&key) {
            warn!(contact_point = %contact_point.contact_point(), "Server already started");
            return Ok(running.bound.clone());
        }

        let context = contact_point.context().clone();
        let broker = Arc::new(MessageBroker::new());
        let server = BrokerServer::bind(
            &contact_point.contact_point().socket_addr(),
            Arc::clone(&broker),
            context.config.max_frame_size,
        )
        .await?;
        let bound = contact_point
            .contact_point()
            .with_port(server.local_addr().port());

        let sweeper = broker.spawn_expiry_sweeper(context.config.message_ttl.max(MIN_SWEEP_INTERVAL));
        let session = Arc::new(LocalSession::new(Arc::clone(&broker)));
        let channel: Arc<dyn MessageChannel> = session.clone();
        let consumer_token = generate_shutdown_token();

        let handshakes = HandshakeDispatcher {
            contact_point: Arc::downgrade(&contact_point),
            channel: Arc::clone(&channel),
            broker: Arc::clone(&broker),
        };
        InboxConsumer::new(
            INITIAL_INBOX,
            Arc::clone(&channel),
            Arc::new(handshakes),
            context.pool.clone(),
            consumer_token.clone(),
            context.config.consumer_poll_interval,
        )
        .spawn();

        let requests = RequestDispatcher::new(
            Arc::clone(&channel),
            contact_point.handler(),
            None,
            context.config.message_ttl,
            context.config.slow_dispatch_threshold,
        );
        InboxConsumer::new(
            REQUEST_INBOX,
            channel,
            Arc::new(requests),
            context.pool.clone(),
            consumer_token.clone(),
            context.config.consumer_poll_interval,
        )
        .spawn();

        contact_point.set_bound(bound.clone());
        contact_point.set_accepting(true);
        info!(contact_point = %bound, node = %contact_point.local().id, "Broker server started");

        servers.insert(
            key,
            RunningServer {
                contact_point,
                bound: bound.clone(),
                broker,
                server,
                session,
                consumer_token,
                sweeper,
            },
        );
        Ok(bound)
    }

    async fn stop_server(&self, contact_point: &ServerContactPoint) -> NetworkResult<()> {
        let key = contact_point.contact_point().endpoint_key();
        let Some(running) = self.servers.lock().await.remove(&key) else {
            debug!(contact_point = %contact_point.contact_point(), "Server not running");
            return Ok(());
        };

        running.contact_point.set_accepting(false);
        running.server.stop_accepting();
        // Stop answering handshakes; the request inbox keeps serving existing connections.
        let pill = shutdown_message(INITIAL_INBOX, &running.consumer_token);
        if let Err(e) = running.session.send(pill).await {
            debug!(error = %e, "Could not stop handshake consumer");
        }
        info!(contact_point = %running.bound, "Broker server stopped accepting connections");

        self.retired.lock().await.push(running);
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
        let (link, broken) = BrokerLink::connect(&contact_point.socket_addr(), context.config.max_frame_size).await?;

        let handshake_timeout = context.config.handshake_timeout;
        let reply = match tokio::time::timeout(handshake_timeout, handshake(&link, local, context)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                link.shutdown();
                return Err(e);
            }
            Err(_) => {
                link.shutdown();
                return Err(NetworkError::HandshakeTimeout(handshake_timeout));
            }
        };

        if reply.identity.id == local.id {
            link.shutdown();
            return Err(NetworkError::ProtocolViolation(REJECT_SAME_NODE_ID.into()));
        }

        let channel: Arc<dyn MessageChannel> = link.clone();
        let connection = Connection::new(
            ConnectionSetup {
                id: context.ids.next_id(),
                role: InitiationRole::SelfInitiated,
                local: local.clone(),
                transport: ConnectionTransport::Broker {
                    channel: Arc::clone(&channel),
                    outgoing_queue: reply.active_request_inbox.clone(),
                },
                shutdown_token: reply.shutdown_token.clone(),
                contact_point: Some(contact_point.clone()),
            },
            context,
        );
        connection.attach_remote(reply.identity.clone());

        // Surface link failure as a broken connection.
        let watched = Arc::downgrade(&connection);
        connection.attach_task(tokio::spawn(async move {
            if let Ok(reason) = broken.await {
                if let Some(connection) = watched.upgrade() {
                    connection.report_broken(reason);
                }
            }
        }));

        if allow_duplex {
            let dispatcher = RequestDispatcher::new(
                Arc::clone(&channel),
                handler,
                Some(reply.identity.id.clone()),
                context.config.message_ttl,
                context.config.slow_dispatch_threshold,
            );
            let consumer = InboxConsumer::new(
                reply.passive_request_inbox.clone(),
                channel,
                Arc::new(dispatcher),
                context.pool.clone(),
                reply.shutdown_token.clone(),
                context.config.consumer_poll_interval,
            );
            connection.attach_task(consumer.spawn());
        }

        info!(
            connection = %connection.id(),
            remote = %reply.identity.id,
            contact_point = %contact_point,
            duplex = allow_duplex,
            "Connected"
        );
        Ok(connection)
    }

    async fn shutdown(&self) {
        let mut running: Vec<RunningServer> = self.servers.lock().await.drain().map(|(_, s)| s).collect();
        running.append(&mut *self.retired.lock().await);
        for server in running {
            server.contact_point.set_accepting(false);
            server.server.shutdown();
            server.session.close().await;
            server.broker.shutdown();
            server.sweeper.abort();
        }
    }
}

async fn handshake(
    link: &BrokerLink,
    local: &NodeIdentity,
    context: &TransportContext,
) -> NetworkResult<HandshakeResponse> {
    let reply_queue = link.create_temporary_queue().await?;
    link.send(initial_message(local, &reply_queue)?.with_ttl(context.config.handshake_timeout))
        .await?;

    let reply = link
        .receive(&reply_queue, context.config.handshake_timeout)
        .await?
        .ok_or(NetworkError::HandshakeTimeout(context.config.handshake_timeout))?;

    parse_handshake_reply(&reply).map_err(|e| match e {
        DecodeError::Rejected(reason) if reason == REJECT_SAME_NODE_ID => {
            NetworkError::ProtocolViolation(reason)
        }
        DecodeError::Rejected(reason) => NetworkError::HandshakeRejected(reason),
        other => NetworkError::ProtocolViolation(other.to_string()),
    })
}

/// Answers initial messages on behalf of one served contact point.
struct HandshakeDispatcher {
    contact_point: Weak<ServerContactPoint>,
    channel: Arc<dyn MessageChannel>,
    broker: Arc<MessageBroker>,
}

impl HandshakeDispatcher {
    /// Close `connection` once the initiator's reply queue is deleted,
    /// which happens when its link ends.
    fn watch_initiator(
        &self,
        reply_to: &str,
        connection: &Arc<Connection>,
        passive_inbox: String,
        handler: Arc<dyn ConnectionEndpointHandler>,
    ) {
        // None means the link ended before the handshake was answered.
        let link_ended = self.broker.watch_deletion(reply_to);
        let broker = Arc::downgrade(&self.broker);
        let watched = Arc::downgrade(connection);
        tokio::spawn(async move {
            if let Some(link_ended) = link_ended {
                // An error means the broker shut down first.
                if link_ended.await.is_err() {
                    return;
                }
            }
            if let Some(connection) = watched.upgrade() {
                handler.on_remote_initiated_connection_lost(connection).await;
            }
            if let Some(broker) = broker.upgrade() {
                broker.delete_queue(&passive_inbox);
            }
        });
    }

    async fn reject(&self, reply_to: &str, reason: &str) {
        if let Err(e) = self.channel.send(handshake_rejection(reply_to, reason)).await {
            debug!(error = %e, "Could not send handshake rejection");
        }
    }
}

#[async_trait]
impl EnvelopeDispatcher for HandshakeDispatcher {
    async fn dispatch(&self, envelope: Envelope) {
        let Some(reply_to) = envelope.reply_to.clone() else {
            warn!("Dropping initial message without reply queue");
            return;
        };
        let Some(contact_point) = self.contact_point.upgrade() else {
            return;
        };

        if !contact_point.is_accepting() {
            self.reject(&reply_to, REJECT_NOT_ACCEPTING).await;
            return;
        }

        let remote = match parse_initial(&envelope) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "Malformed initial message");
                self.reject(&reply_to, &format!("Malformed initial message: {}", e)).await;
                return;
            }
        };

        if remote.id == contact_point.local().id {
            warn!(node = %remote.id, "Rejecting handshake from a node with our own id");
            self.reject(&reply_to, REJECT_SAME_NODE_ID).await;
            return;
        }

        let handler = contact_point.handler();
        let context = contact_point.context();
        let local = handler.exchange_node_information(&remote);

        let connection_id = context.ids.next_id();
        let passive_inbox = passive_request_inbox(&remote.id, connection_id.as_str());
        let token = generate_shutdown_token();

        let connection = Connection::new(
            ConnectionSetup {
                id: connection_id,
                role: InitiationRole::RemoteInitiated,
                local: local.clone(),
                transport: ConnectionTransport::Broker {
                    channel: Arc::clone(&self.channel),
                    outgoing_queue: passive_inbox.clone(),
                },
                shutdown_token: token.clone(),
                contact_point: None,
            },
            context,
        );
        connection.attach_remote(remote.clone());
        handler
            .on_remote_initiated_connection_established(Arc::clone(&connection), &contact_point)
            .await;
        self.watch_initiator(&reply_to, &connection, passive_inbox.clone(), handler);

        let reply = match handshake_reply(&reply_to, &local, REQUEST_INBOX, &passive_inbox, &token) {
            Ok(reply) => reply.with_ttl(context.config.handshake_timeout),
            Err(e) => {
                warn!(error = %e, "Could not encode handshake reply");
                return;
            }
        };
        if let Err(e) = self.channel.send(reply).await {
            warn!(remote = %remote.id, error = %e, "Could not send handshake reply");
            return;
        }
        debug!(remote = %remote.id, connection = %connection.id(), "Handshake answered");
    }
}
