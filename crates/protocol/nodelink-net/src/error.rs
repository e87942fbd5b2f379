//! Network error types.
//!
//! This module defines all error types for the nodelink-net crate.

use std::time::Duration;

use thiserror::Error;

/// Network-specific errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NetworkError {
    /// The transport-level link could not be established.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// The handshake did not complete in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The peer violated the handshake or message protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server refused the handshake.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The underlying link broke.
    #[error("connection broken: {0}")]
    ConnectionBroken(String),

    /// The connection or link was closed locally.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// No connection with this id is registered.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// No transport provider with this id is registered.
    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    /// A transport provider with this id is already registered.
    #[error("duplicate transport id: {0}")]
    DuplicateTransport(String),

    /// Another server already listens on this contact point.
    #[error("already listening on {0}")]
    AlreadyListening(String),

    /// A broker operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The broker reported an error.
    #[error("broker error: {0}")]
    Broker(String),

    /// Failed to encode a message.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a message.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Internal channel closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nodelink_wire::EncodeError> for NetworkError {
    fn from(err: nodelink_wire::EncodeError) -> Self {
        Self::Encoding(err.to_string())
    }
}

impl From<nodelink_wire::DecodeError> for NetworkError {
    fn from(err: nodelink_wire::DecodeError) -> Self {
        Self::Decoding(err.to_string())
    }
}

impl NetworkError {
    /// Get a user-friendly suggestion for recovering from this error.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::ConnectFailed(_) | Self::Io(_) => {
                "Check network connectivity. Verify the contact point is reachable and its server is running."
            }
            Self::HandshakeTimeout(_) => {
                "The peer did not answer the handshake in time. Retry with backoff."
            }
            Self::ProtocolViolation(_) | Self::Encoding(_) | Self::Decoding(_) => {
                "The peer sent an unexpected message. Check the contact configuration and peer version."
            }
            Self::HandshakeRejected(_) => {
                "The server refused the connection. It may be stopped or not accepting connections yet."
            }
            Self::ConnectionBroken(_) => {
                "The connection broke. Reconnect to the peer."
            }
            Self::ConnectionClosed(_) | Self::UnknownConnection(_) => {
                "The connection is no longer open. Reconnect to the peer."
            }
            Self::UnknownTransport(_) => {
                "No transport provider handles this contact point. Check the transport id."
            }
            Self::DuplicateTransport(_) => {
                "A transport provider with this id is already registered."
            }
            Self::AlreadyListening(_) => {
                "Another server already uses this contact point. Choose a different port."
            }
            Self::Timeout(_) => {
                "The operation timed out. Try again or increase the timeout."
            }
            Self::Broker(_) => "The message broker reported an error.",
            Self::ChannelClosed => {
                "Internal channel closed. The connection service may have shut down."
            }
        }
    }

    /// Returns true if this error is transient and the operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_)
                | Self::HandshakeTimeout(_)
                | Self::HandshakeRejected(_)
                | Self::ConnectionBroken(_)
                | Self::Timeout(_)
                | Self::Io(_)
        )
    }

    /// Returns true for timeouts, including handshake timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::HandshakeTimeout(_) | Self::Timeout(_))
    }

    /// Returns true if the link underneath is gone.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionBroken(_) | Self::ConnectionClosed(_) | Self::Io(_) | Self::ChannelClosed
        )
    }
}

/// Result type alias using NetworkError.
pub type NetworkResult<T> = Result<T, NetworkError>;
