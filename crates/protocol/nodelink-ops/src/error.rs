//! Error types for the operations layer.
//!
//! This module defines the `OpsError` enum used by routing, discovery,
//! the service registry and the communication facade.

use nodelink_types::{NodeId, ResultCode};
use thiserror::Error;

/// Result type for operations.
pub type OpsResult<T> = std::result::Result<T, OpsError>;

/// Errors that can occur in the operations layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OpsError {
    // =========================================================================
    // Routing Errors
    // =========================================================================
    /// No route towards a node is known.
    #[error("found no route towards '{0}'")]
    NoRoute(NodeId),

    /// A routed request travelled too many hops.
    #[error("hop count {hops} exceeds the limit of {limit}")]
    HopLimitExceeded {
        /// Hops travelled so far.
        hops: u32,
        /// Configured maximum.
        limit: u32,
    },

    /// The static contact map has no entry for a platform.
    #[error("communication contact for platform \"{0}\" could not be found")]
    NoContact(String),

    /// A contact mapping could not be parsed.
    #[error("invalid contact mapping '{input}': {reason}")]
    InvalidMapping {
        /// Offending mapping.
        input: String,
        /// What is wrong with it.
        reason: String,
    },

    // =========================================================================
    // Remote Call Errors
    // =========================================================================
    /// A remote node answered with a failure response.
    #[error("remote failure ({code}): {message}")]
    Remote {
        /// Result code of the response.
        code: ResultCode,
        /// Error message carried by the response.
        message: String,
    },

    /// No local service matches the requested name and properties.
    #[error("the requested service is not available: {0}")]
    ServiceNotAvailable(String),

    /// A local service failed.
    #[error("service '{service}' failed: {message}")]
    ServiceFailed {
        /// Service name.
        service: String,
        /// Failure description.
        message: String,
    },

    /// A node is not known to the local node.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// Invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// Network error.
    #[error("network error: {0}")]
    Network(#[from] nodelink_net::NetworkError),

    /// Value type error.
    #[error("invalid value: {0}")]
    Types(#[from] nodelink_types::TypesError),

    /// Payload could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] nodelink_wire::EncodeError),

    /// Payload could not be decoded.
    #[error("decoding error: {0}")]
    Decoding(#[from] nodelink_wire::DecodeError),
}

impl OpsError {
    /// Create an invalid operation error.
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        OpsError::InvalidOperation(msg.into())
    }

    /// Create an invalid mapping error.
    pub fn invalid_mapping(input: impl Into<String>, reason: impl Into<String>) -> Self {
        OpsError::InvalidMapping {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Result code to report when this error ends a request.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::NoRoute(_) | Self::HopLimitExceeded { .. } | Self::NoContact(_) => {
                ResultCode::ExceptionWhileForwarding
            }
            Self::Remote { code, .. } => *code,
            Self::Network(e) if e.is_timeout() => ResultCode::Timeout,
            Self::Network(e) if e.is_link_failure() => ResultCode::ConnectionBroken,
            Self::Decoding(_) => ResultCode::ProtocolError,
            _ => ResultCode::ExceptionAtDestination,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NoRoute(_) => true,
            Self::Remote { code, .. } => matches!(
                code,
                ResultCode::Timeout | ResultCode::ConnectionBroken | ResultCode::ExceptionWhileForwarding
            ),
            Self::Network(e) => e.is_transient(),
            _ => false,
        }
    }
}
