//! Message type tags and the envelope carried by every queue.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nodelink_types::constants::MESSAGE_TTL_MS;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Message type tag.
///
/// Replies carry no tag; every message sent to a well-known or passive
/// inbox carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Initial handshake carrying the initiator's identity.
    Initial,
    /// Request carrying content and metadata.
    Request,
    /// Poison pill carrying a shutdown token.
    Shutdown,
}

impl MessageType {
    /// Wire name of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Request => "request",
            Self::Shutdown => "shutdown",
        }
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "initial" => Some(Self::Initial),
            "request" => Some(Self::Request),
            "shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A queued message.
///
/// `properties` hold transport-level fields (queue names, tokens, ids,
/// result codes); `metadata` holds the request's own metadata map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Type tag, absent on replies.
    pub message_type: Option<MessageType>,
    /// Queue this message is addressed to.
    pub destination: String,
    /// Queue the receiver should reply to.
    pub reply_to: Option<String>,
    /// Transport-level string properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Request metadata (request messages only).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Message body.
    #[serde(default)]
    pub body: Vec<u8>,
    /// Absolute expiry time in milliseconds since the epoch.
    pub expires_at_ms: u64,
}

impl Envelope {
    /// Create an envelope expiring after the default message TTL.
    pub fn new(message_type: Option<MessageType>, destination: impl Into<String>) -> Self {
        Self {
            message_type,
            destination: destination.into(),
            reply_to: None,
            properties: BTreeMap::new(),
            metadata: BTreeMap::new(),
            body: Vec::new(),
            expires_at_ms: now_millis() + MESSAGE_TTL_MS,
        }
    }

    /// Set the reply queue.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Set a transport property.
    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Replace the time-to-live, counted from now.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at_ms = now_millis() + ttl.as_millis() as u64;
        self
    }

    /// Whether the message has outlived its TTL at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Value of a transport property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Value of a required transport property.
    pub fn require_property(&self, key: &'static str) -> Result<&str, DecodeError> {
        self.property(key).ok_or(DecodeError::MissingProperty(key))
    }

    /// Fail unless the envelope carries the given type tag.
    pub fn expect_type(&self, expected: MessageType) -> Result<(), DecodeError> {
        match self.message_type {
            Some(t) if t == expected => Ok(()),
            other => Err(DecodeError::UnexpectedMessageType {
                expected: expected.to_string(),
                got: other.map(|t| t.to_string()).unwrap_or_else(|| "none".into()),
            }),
        }
    }
}
