//! Error types for the wire module.
//!
//! This module defines errors that can occur while encoding envelopes and
//! payloads, and while interpreting a decoded envelope.

use thiserror::Error;

/// Errors that can occur when encoding an envelope or payload.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EncodeError {
    /// CBOR encoding failed
    #[error("CBOR encoding failed: {0}")]
    Cbor(String),

    /// Payload exceeds maximum allowed size
    #[error("payload too large: {size} bytes exceeds maximum {max} bytes")]
    PayloadTooLarge {
        /// Actual size of the payload
        size: usize,
        /// Maximum allowed size
        max: usize,
    },
}

impl From<ciborium::ser::Error<std::io::Error>> for EncodeError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        EncodeError::Cbor(err.to_string())
    }
}

/// Errors that can occur when decoding or interpreting an envelope.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// Failed to decode CBOR
    #[error("payload decode failed: {0}")]
    PayloadDecodeFailed(String),

    /// Envelope has a different message type than expected
    #[error("unexpected message type: expected {expected}, got {got}")]
    UnexpectedMessageType {
        /// Expected type tag
        expected: String,
        /// Received type tag, or "none"
        got: String,
    },

    /// A required envelope property is absent
    #[error("missing required property: {0}")]
    MissingProperty(&'static str),

    /// A property is present but malformed
    #[error("invalid property {name}: {reason}")]
    InvalidProperty {
        /// Property name
        name: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// The remote side explicitly rejected the handshake
    #[error("handshake rejected: {0}")]
    Rejected(String),
}
