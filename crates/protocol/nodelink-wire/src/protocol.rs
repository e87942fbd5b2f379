//! Building and interpreting protocol messages.
//!
//! # Handshake
//!
//! ```text
//! initiator                                   responder
//!    | -- initial(identity) -> INITIAL_INBOX -->  |
//!    | <-- reply(identity, active, passive, token) |
//! ```
//!
//! The reply either carries the responder's identity plus the three
//! handshake properties, or a single [`props::ERROR`] property when the
//! responder rejects the attempt.

use nodelink_types::{NetworkRequest, NetworkResponse, NodeIdentity, ResultCode};

use crate::encoding::{decode_payload, encode_payload};
use crate::error::{DecodeError, EncodeError};
use crate::message::{Envelope, MessageType};
use crate::queues::{props, INITIAL_INBOX};

// =============================================================================
// Handshake
// =============================================================================

/// Handshake reply contents as seen by the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Responder identity.
    pub identity: NodeIdentity,
    /// Queue the initiator sends its requests to.
    pub active_request_inbox: String,
    /// Queue the responder sends requests to the initiator on.
    pub passive_request_inbox: String,
    /// Token that authorizes shutdown of the passive inbox consumer.
    pub shutdown_token: String,
}

/// Rejection reason sent when both parties share a node id.
pub const REJECT_SAME_NODE_ID: &str = "Invalid setup: Remote and local node share the same node id";

/// Rejection reason sent by a server that is not accepting connections.
pub const REJECT_NOT_ACCEPTING: &str = "Server is not accepting connections";

/// Initial handshake message for the responder's initial inbox.
pub fn initial_message(identity: &NodeIdentity, reply_to: &str) -> Result<Envelope, EncodeError> {
    Ok(Envelope::new(Some(MessageType::Initial), INITIAL_INBOX)
        .with_reply_to(reply_to)
        .with_body(encode_payload(identity)?))
}

/// Extract the initiator identity from an initial message.
pub fn parse_initial(envelope: &Envelope) -> Result<NodeIdentity, DecodeError> {
    envelope.expect_type(MessageType::Initial)?;
    decode_payload(&envelope.body)
}

/// Successful handshake reply.
pub fn handshake_reply(
    reply_to: &str,
    identity: &NodeIdentity,
    active_request_inbox: &str,
    passive_request_inbox: &str,
    shutdown_token: &str,
) -> Result<Envelope, EncodeError> {
    Ok(Envelope::new(None, reply_to)
        .with_property(props::ACTIVE_REQUEST_INBOX, active_request_inbox)
        .with_property(props::PASSIVE_REQUEST_INBOX, passive_request_inbox)
        .with_property(props::SHUTDOWN_TOKEN, shutdown_token)
        .with_body(encode_payload(identity)?))
}

/// Handshake rejection.
pub fn handshake_rejection(reply_to: &str, reason: &str) -> Envelope {
    Envelope::new(None, reply_to).with_property(props::ERROR, reason)
}

/// Interpret a handshake reply.
pub fn parse_handshake_reply(envelope: &Envelope) -> Result<HandshakeResponse, DecodeError> {
    if let Some(reason) = envelope.property(props::ERROR) {
        return Err(DecodeError::Rejected(reason.to_string()));
    }
    let active_request_inbox = envelope.require_property(props::ACTIVE_REQUEST_INBOX)?.to_string();
    let passive_request_inbox = envelope.require_property(props::PASSIVE_REQUEST_INBOX)?.to_string();
    let shutdown_token = envelope.require_property(props::SHUTDOWN_TOKEN)?.to_string();
    let identity = decode_payload(&envelope.body)?;
    Ok(HandshakeResponse {
        identity,
        active_request_inbox,
        passive_request_inbox,
        shutdown_token,
    })
}

// =============================================================================
// Requests and Responses
// =============================================================================

/// Request message for `destination`, answered on `reply_to`.
pub fn request_message(request: &NetworkRequest, destination: &str, reply_to: &str) -> Envelope {
    let mut envelope = Envelope::new(Some(MessageType::Request), destination)
        .with_reply_to(reply_to)
        .with_property(props::REQUEST_ID, request.request_id())
        .with_body(request.content().to_vec());
    envelope.metadata = request.metadata().clone();
    envelope
}

/// Rebuild the request carried by a request message.
pub fn parse_request(envelope: &Envelope) -> Result<NetworkRequest, DecodeError> {
    envelope.expect_type(MessageType::Request)?;
    let request_id = envelope.require_property(props::REQUEST_ID)?;
    Ok(NetworkRequest::from_parts(
        request_id,
        envelope.body.clone(),
        envelope.metadata.clone(),
    ))
}

/// Reply message carrying `response`.
pub fn response_message(response: &NetworkResponse, destination: &str) -> Envelope {
    let mut envelope = Envelope::new(None, destination)
        .with_property(props::REQUEST_ID, response.request_id())
        .with_property(props::RESULT_CODE, response.result_code().code().to_string())
        .with_body(response.content().to_vec());
    envelope.metadata = response.metadata().clone();
    envelope
}

/// Rebuild the response carried by a reply message.
pub fn parse_response(envelope: &Envelope) -> Result<NetworkResponse, DecodeError> {
    let request_id = envelope.require_property(props::REQUEST_ID)?;
    let raw_code = envelope.require_property(props::RESULT_CODE)?;
    let code = raw_code
        .parse::<u16>()
        .map_err(|e| DecodeError::InvalidProperty {
            name: props::RESULT_CODE,
            reason: e.to_string(),
        })
        .and_then(|c| {
            ResultCode::from_code(c).map_err(|e| DecodeError::InvalidProperty {
                name: props::RESULT_CODE,
                reason: e.to_string(),
            })
        })?;
    Ok(NetworkResponse::from_parts(
        request_id,
        code,
        envelope.body.clone(),
        envelope.metadata.clone(),
    ))
}

// =============================================================================
// Shutdown
// =============================================================================

/// Poison pill for the consumer of `destination`.
pub fn shutdown_message(destination: &str, token: &str) -> Envelope {
    Envelope::new(Some(MessageType::Shutdown), destination).with_body(token.as_bytes().to_vec())
}

/// Token carried by a shutdown message, if it is one.
pub fn shutdown_token(envelope: &Envelope) -> Option<String> {
    match envelope.message_type {
        Some(MessageType::Shutdown) => Some(String::from_utf8_lossy(&envelope.body).into_owned()),
        _ => None,
    }
}
