//! Request and response values exchanged over connections.
//!
//! A [`NetworkRequest`] is opaque content plus a string-keyed metadata map.
//! A [`NetworkResponse`] is produced exactly once per request and carries a
//! [`ResultCode`] describing the outcome.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypesError;
use crate::identity::NodeId;

// =============================================================================
// Metadata Keys
// =============================================================================

/// Well-known metadata keys.
pub mod keys {
    pub const CATEGORY: &str = "category";
    pub const TOPIC: &str = "topic";
    pub const TYPE: &str = "type";
    pub const HOP_COUNT: &str = "hopcount";
    pub const RECEIVER: &str = "receiver";
    pub const SENDER: &str = "sender";
    pub const TRACE: &str = "trace";
    pub const METHOD: &str = "method";
    pub const RESULT_CODE: &str = "response.resultCode";
    pub const ERROR: &str = "response.error";
}

/// Well-known values of the `category` metadata key.
pub mod categories {
    pub const HEALTH_CHECK: &str = "healthcheck";
    pub const ROUTING: &str = "routing";
    pub const RPC: &str = "rpc";
}

// =============================================================================
// ResultCode
// =============================================================================

/// Outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
#[non_exhaustive]
pub enum ResultCode {
    /// Request was handled successfully.
    Success = 0,
    /// The handler at the destination failed.
    ExceptionAtDestination = 1,
    /// An intermediate node could not forward the request.
    ExceptionWhileForwarding = 2,
    /// No handler at the destination accepted the request.
    NoMatchingHandler = 3,
    /// No response within the timeout while the connection was open.
    Timeout = 10,
    /// No response within the timeout after the connection was closed.
    TimeoutAfterClose = 11,
    /// The connection broke while the request was outstanding.
    ConnectionBroken = 12,
    /// A malformed message was received.
    ProtocolError = 13,
    /// Outcome unknown.
    Undefined = 0xFFFF,
}

impl ResultCode {
    /// Numeric code value.
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Parse a numeric code value.
    pub fn from_code(code: u16) -> Result<Self, TypesError> {
        match code {
            0 => Ok(Self::Success),
            1 => Ok(Self::ExceptionAtDestination),
            2 => Ok(Self::ExceptionWhileForwarding),
            3 => Ok(Self::NoMatchingHandler),
            10 => Ok(Self::Timeout),
            11 => Ok(Self::TimeoutAfterClose),
            12 => Ok(Self::ConnectionBroken),
            13 => Ok(Self::ProtocolError),
            0xFFFF => Ok(Self::Undefined),
            other => Err(TypesError::UnknownResultCode(other)),
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Self::Success
    }

    /// Whether this code was produced locally because no answer arrived.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout | Self::TimeoutAfterClose)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::ExceptionAtDestination => "EXCEPTION_AT_DESTINATION",
            Self::ExceptionWhileForwarding => "EXCEPTION_WHILE_FORWARDING",
            Self::NoMatchingHandler => "NO_MATCHING_HANDLER",
            Self::Timeout => "TIMEOUT",
            Self::TimeoutAfterClose => "TIMEOUT_AFTER_CLOSE",
            Self::ConnectionBroken => "CONNECTION_BROKEN",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::Undefined => "UNDEFINED",
        };
        f.write_str(name)
    }
}

// =============================================================================
// NetworkRequest
// =============================================================================

/// An outgoing or incoming request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    request_id: String,
    content: Vec<u8>,
    metadata: BTreeMap<String, String>,
}

impl NetworkRequest {
    /// Create a request with a fresh request id.
    pub fn new(content: impl Into<Vec<u8>>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            content: content.into(),
            metadata,
        }
    }

    /// Rebuild a request received from the wire, keeping its id.
    pub fn from_parts(
        request_id: impl Into<String>,
        content: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            content,
            metadata,
        }
    }

    /// Start building a request.
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Vec<u8> {
        self.content
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Value of an arbitrary metadata key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn category(&self) -> Option<&str> {
        self.get(keys::CATEGORY)
    }

    pub fn topic(&self) -> Option<&str> {
        self.get(keys::TOPIC)
    }

    pub fn method(&self) -> Option<&str> {
        self.get(keys::METHOD)
    }

    pub fn trace(&self) -> Option<&str> {
        self.get(keys::TRACE)
    }

    /// Sender node id, if present and well formed.
    pub fn sender(&self) -> Option<NodeId> {
        self.get(keys::SENDER).and_then(|s| NodeId::new(s).ok())
    }

    /// Final receiver node id, if present and well formed.
    pub fn receiver(&self) -> Option<NodeId> {
        self.get(keys::RECEIVER).and_then(|s| NodeId::new(s).ok())
    }

    /// Number of hops travelled so far (0 if absent or malformed).
    pub fn hop_count(&self) -> u32 {
        self.get(keys::HOP_COUNT)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// Copy of this request with one more hop recorded, keeping the id.
    pub fn forwarded(&self) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.insert(keys::HOP_COUNT.to_string(), (self.hop_count() + 1).to_string());
        Self {
            request_id: self.request_id.clone(),
            content: self.content.clone(),
            metadata,
        }
    }

    /// Copy of this request with an additional metadata entry, keeping the id.
    pub fn with_metadata(&self, key: &str, value: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.metadata.insert(key.to_string(), value.into());
        copy
    }
}

/// Builder for [`NetworkRequest`].
#[derive(Debug, Default)]
pub struct RequestBuilder {
    content: Vec<u8>,
    metadata: BTreeMap<String, String>,
}

impl RequestBuilder {
    pub fn content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = content.into();
        self
    }

    pub fn metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn category(self, category: &str) -> Self {
        self.metadata(keys::CATEGORY, category)
    }

    pub fn topic(self, topic: &str) -> Self {
        self.metadata(keys::TOPIC, topic)
    }

    pub fn sender(self, sender: &NodeId) -> Self {
        self.metadata(keys::SENDER, sender.as_str())
    }

    pub fn receiver(self, receiver: &NodeId) -> Self {
        self.metadata(keys::RECEIVER, receiver.as_str())
    }

    pub fn build(self) -> NetworkRequest {
        NetworkRequest::new(self.content, self.metadata)
    }
}

// =============================================================================
// NetworkResponse
// =============================================================================

/// Response to exactly one [`NetworkRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResponse {
    request_id: String,
    content: Vec<u8>,
    result_code: ResultCode,
    metadata: BTreeMap<String, String>,
}

impl NetworkResponse {
    /// Successful response carrying `content`.
    pub fn success(request: &NetworkRequest, content: impl Into<Vec<u8>>) -> Self {
        Self::with_code(request.request_id(), ResultCode::Success, content.into(), None)
    }

    /// Failure response with a human-readable cause.
    pub fn failure(request: &NetworkRequest, code: ResultCode, cause: impl fmt::Display) -> Self {
        Self::failure_for(request.request_id(), code, cause)
    }

    /// Failure response for a request known only by id.
    pub fn failure_for(request_id: &str, code: ResultCode, cause: impl fmt::Display) -> Self {
        Self::with_code(request_id, code, Vec::new(), Some(cause.to_string()))
    }

    /// Rebuild a response received from the wire.
    pub fn from_parts(
        request_id: impl Into<String>,
        result_code: ResultCode,
        content: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            content,
            result_code,
            metadata,
        }
    }

    fn with_code(request_id: &str, code: ResultCode, content: Vec<u8>, error: Option<String>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(keys::RESULT_CODE.to_string(), code.code().to_string());
        if let Some(error) = error {
            metadata.insert(keys::ERROR.to_string(), error);
        }
        Self {
            request_id: request_id.to_string(),
            content,
            result_code: code,
            metadata,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Vec<u8> {
        self.content
    }

    pub fn result_code(&self) -> ResultCode {
        self.result_code
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn is_success(&self) -> bool {
        self.result_code.is_success()
    }

    /// Failure cause, if this is a failure response.
    pub fn error_message(&self) -> Option<&str> {
        self.metadata.get(keys::ERROR).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_roundtrip() {
        for code in [
            ResultCode::Success,
            ResultCode::ExceptionAtDestination,
            ResultCode::ExceptionWhileForwarding,
            ResultCode::NoMatchingHandler,
            ResultCode::Timeout,
            ResultCode::TimeoutAfterClose,
            ResultCode::ConnectionBroken,
            ResultCode::ProtocolError,
            ResultCode::Undefined,
        ] {
            assert_eq!(ResultCode::from_code(code.code()).unwrap(), code);
        }
        assert!(ResultCode::from_code(999).is_err());
    }

    #[test]
    fn test_request_builder_and_accessors() {
        let sender = NodeId::new("aaa").unwrap();
        let request = NetworkRequest::builder()
            .content(b"ping".to_vec())
            .category(categories::HEALTH_CHECK)
            .sender(&sender)
            .build();

        assert_eq!(request.content(), b"ping");
        assert_eq!(request.category(), Some("healthcheck"));
        assert_eq!(request.sender(), Some(sender));
        assert_eq!(request.hop_count(), 0);
        assert_eq!(request.request_id().len(), 32);
    }

    #[test]
    fn test_request_ids_unique() {
        let a = NetworkRequest::new(Vec::new(), BTreeMap::new());
        let b = NetworkRequest::new(Vec::new(), BTreeMap::new());
        assert_ne!(a.request_id(), b.request_id());
    }

    #[test]
    fn test_forwarded_increments_hop_count() {
        let request = NetworkRequest::builder().content(b"x".to_vec()).build();
        let once = request.forwarded();
        let twice = once.forwarded();
        assert_eq!(once.hop_count(), 1);
        assert_eq!(twice.hop_count(), 2);
        assert_eq!(twice.request_id(), request.request_id());
        assert_eq!(request.hop_count(), 0);
    }

    #[test]
    fn test_response_success_and_failure() {
        let request = NetworkRequest::builder().content(b"x".to_vec()).build();

        let ok = NetworkResponse::success(&request, b"pong".to_vec());
        assert!(ok.is_success());
        assert_eq!(ok.request_id(), request.request_id());
        assert_eq!(ok.content(), b"pong");
        assert!(ok.error_message().is_none());

        let failed = NetworkResponse::failure(&request, ResultCode::Timeout, "no answer");
        assert!(!failed.is_success());
        assert!(failed.result_code().is_timeout());
        assert_eq!(failed.error_message(), Some("no answer"));
        assert_eq!(
            failed.metadata().get(keys::RESULT_CODE).map(String::as_str),
            Some("10")
        );
    }
}
