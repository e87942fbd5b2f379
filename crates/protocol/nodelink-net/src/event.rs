//! Network events.
//!
//! This module defines the events published by the connection service and
//! the internal broken-connection reports that feed it.

use nodelink_types::{NodeId, NodeIdentity};
use tokio::sync::mpsc;

use crate::connection::{ConnectionId, InitiationRole};

/// Events published by the connection service.
///
/// Subscribers obtain a receiver with `NetworkConnectionService::subscribe()`.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum NetworkEvent {
    /// A connection was registered, in either direction.
    ConnectionEstablished {
        /// Connection id.
        connection_id: ConnectionId,
        /// Which side initiated it.
        role: InitiationRole,
        /// The remote node.
        remote: NodeIdentity,
    },

    /// A connection was closed locally.
    ConnectionClosed {
        /// Connection id.
        connection_id: ConnectionId,
        /// The remote node, if the handshake completed.
        remote: Option<NodeId>,
    },

    /// A self-initiated connection broke and was unregistered.
    ConnectionBroken {
        /// Connection id.
        connection_id: ConnectionId,
        /// The remote node, if the handshake completed.
        remote: Option<NodeId>,
        /// Why the connection was declared broken.
        reason: String,
    },

    /// A request arrived from a remote node.
    RequestReceived {
        /// Sending node.
        sender: NodeId,
        /// Request id.
        request_id: String,
        /// Request category, if set.
        category: Option<String>,
    },

    /// A health check failed.
    HealthCheckFailed {
        /// Connection id.
        connection_id: ConnectionId,
        /// Consecutive failures so far.
        consecutive_failures: u32,
    },

    /// A health check succeeded after earlier failures.
    HealthCheckRecovered {
        /// Connection id.
        connection_id: ConnectionId,
        /// Failures before this success.
        previous_failures: u32,
    },
}

impl NetworkEvent {
    /// Remote node this event concerns, if any.
    pub fn remote(&self) -> Option<&NodeId> {
        match self {
            Self::ConnectionEstablished { remote, .. } => Some(&remote.id),
            Self::ConnectionClosed { remote, .. } | Self::ConnectionBroken { remote, .. } => {
                remote.as_ref()
            }
            Self::RequestReceived { sender, .. } => Some(sender),
            _ => None,
        }
    }

    /// Whether the set of live connections changed.
    pub fn is_topology_change(&self) -> bool {
        matches!(
            self,
            Self::ConnectionEstablished { .. }
                | Self::ConnectionClosed { .. }
                | Self::ConnectionBroken { .. }
        )
    }
}

/// Report that a connection's underlying link failed.
#[derive(Debug, Clone)]
pub struct BrokenConnection {
    /// Connection id.
    pub connection_id: ConnectionId,
    /// Which side initiated the connection.
    pub role: InitiationRole,
    /// The remote node, if known.
    pub remote: Option<NodeId>,
    /// What went wrong.
    pub reason: String,
}

/// Channel on which connections report that they broke.
pub type BrokenConnectionSink = mpsc::UnboundedSender<BrokenConnection>;
