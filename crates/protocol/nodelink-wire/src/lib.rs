//! Wire messages for the nodelink communication layer.
//!
//! Every message travelling through a broker queue is an [`Envelope`]:
//! an optional [`MessageType`] tag, a destination queue, an optional reply
//! queue, transport properties, request metadata, a body and an absolute
//! expiry time. Envelopes are CBOR encoded.
//!
//! # Module Organization
//!
//! - [`message`] - Type tags and the envelope
//! - [`queues`] - Well-known inboxes, passive and temporary queue names, property names
//! - [`protocol`] - Handshake, request, response and shutdown messages
//! - [`encoding`] - CBOR encoding
//! - [`error`] - Encode and decode errors
//!
//! # Example
//!
//! ```
//! use nodelink_types::{NodeId, NodeIdentity};
//! use nodelink_wire::{decode_envelope, encode_envelope, initial_message, parse_initial};
//!
//! let me = NodeIdentity::new(NodeId::new("aaa").unwrap(), "Node A");
//! let envelope = initial_message(&me, "nodelink.tmp.reply").unwrap();
//!
//! let bytes = encode_envelope(&envelope).unwrap();
//! let decoded = decode_envelope(&bytes).unwrap();
//! assert_eq!(parse_initial(&decoded).unwrap(), me);
//! ```

pub mod encoding;
pub mod error;
pub mod message;
pub mod protocol;
pub mod queues;

pub use encoding::{decode_envelope, decode_payload, encode_envelope, encode_payload};
pub use error::{DecodeError, EncodeError};
pub use message::{now_millis, Envelope, MessageType};
pub use protocol::{
    handshake_rejection, handshake_reply, initial_message, parse_handshake_reply, parse_initial,
    parse_request, parse_response, request_message, response_message, shutdown_message,
    shutdown_token, HandshakeResponse, REJECT_NOT_ACCEPTING, REJECT_SAME_NODE_ID,
};
pub use queues::{
    generate_shutdown_token, is_passive_request_inbox, is_temporary_queue, passive_request_inbox,
    props, temporary_queue_name, INITIAL_INBOX, REQUEST_INBOX,
};
