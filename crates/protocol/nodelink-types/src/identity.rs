//! Node identity types.
//!
//! A node is identified by a [`NodeId`], a stable string that survives
//! restarts. [`NodeIdentity`] bundles the id with the descriptive
//! information a node presents to its peers during the handshake.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};

/// Length of a generated persistent node id (dash-less UUID).
pub const PERSISTENT_ID_LENGTH: usize = 32;

// =============================================================================
// NodeId
// =============================================================================

/// Globally unique identifier of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id, rejecting empty strings and whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(TypesError::InvalidNodeId(id));
        }
        Ok(Self(id))
    }

    /// Generate a fresh persistent id: 32 lowercase hex digits.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Parse an operator-supplied persistent id override.
    pub fn from_persistent(id: &str) -> Result<Self> {
        let candidate = Self(id.to_string());
        if candidate.is_persistent_format() {
            Ok(candidate)
        } else {
            Err(TypesError::InvalidPersistentId(id.to_string()))
        }
    }

    /// Whether this id has the generated `[0-9a-f]{32}` form.
    pub fn is_persistent_format(&self) -> bool {
        self.0.len() == PERSISTENT_ID_LENGTH
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// LegacyNodeId
// =============================================================================

/// Legacy `host:instance` form of a node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LegacyNodeId {
    pub host: String,
    pub instance: u32,
}

impl LegacyNodeId {
    pub fn new(host: impl Into<String>, instance: u32) -> Self {
        Self {
            host: host.into(),
            instance,
        }
    }
}

impl fmt::Display for LegacyNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.instance)
    }
}

impl FromStr for LegacyNodeId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, instance) = s
            .rsplit_once(':')
            .ok_or_else(|| TypesError::InvalidLegacyId(s.to_string()))?;
        if host.is_empty() {
            return Err(TypesError::InvalidLegacyId(s.to_string()));
        }
        let instance = instance
            .parse()
            .map_err(|_| TypesError::InvalidLegacyId(s.to_string()))?;
        Ok(Self::new(host, instance))
    }
}

// =============================================================================
// NodeIdentity
// =============================================================================

/// Information a node presents about itself.
///
/// Equality and hashing consider the id only; two identities with the same
/// id but different display names describe the same node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Stable node id.
    pub id: NodeId,
    /// Human-readable name.
    pub display_name: String,
    /// Whether this node executes workflows.
    #[serde(default)]
    pub is_workflow_host: bool,
    /// Reserved for a future signing key.
    #[serde(default)]
    pub public_key: Option<String>,
    /// Legacy `host:instance` identifier, if known.
    #[serde(default)]
    pub legacy_id: Option<LegacyNodeId>,
}

impl NodeIdentity {
    /// Create an identity with the given id and display name.
    pub fn new(id: NodeId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            is_workflow_host: false,
            public_key: None,
            legacy_id: None,
        }
    }

    /// Mark the node as a workflow host.
    pub fn with_workflow_host(mut self, is_workflow_host: bool) -> Self {
        self.is_workflow_host = is_workflow_host;
        self
    }

    /// Attach a legacy identifier.
    pub fn with_legacy_id(mut self, legacy_id: LegacyNodeId) -> Self {
        self.legacy_id = Some(legacy_id);
        self
    }

    /// Attach a public key.
    pub fn with_public_key(mut self, public_key: impl Into<String>) -> Self {
        self.public_key = Some(public_key.into());
        self
    }

    /// Whether this identity refers to the node with `id`.
    pub fn is(&self, id: &NodeId) -> bool {
        &self.id == id
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeIdentity {}

impl Hash for NodeIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" [{}]", self.display_name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_validation() {
        assert!(NodeId::new("aaa").is_ok());
        assert!(NodeId::new("").is_err());
        assert!(NodeId::new("has space").is_err());
    }

    #[test]
    fn test_generated_id_is_persistent_format() {
        let id = NodeId::generate();
        assert_eq!(id.as_str().len(), PERSISTENT_ID_LENGTH);
        assert!(id.is_persistent_format());
        assert_ne!(id, NodeId::generate());
    }

    #[test]
    fn test_persistent_override() {
        assert!(NodeId::from_persistent("0123456789abcdef0123456789abcdef").is_ok());
        assert!(NodeId::from_persistent("0123456789ABCDEF0123456789ABCDEF").is_err());
        assert!(NodeId::from_persistent("abc").is_err());
    }

    #[test]
    fn test_legacy_id_parse() {
        let legacy: LegacyNodeId = "host.example.org:2".parse().unwrap();
        assert_eq!(legacy.host, "host.example.org");
        assert_eq!(legacy.instance, 2);
        assert_eq!(legacy.to_string(), "host.example.org:2");

        assert!("nohost".parse::<LegacyNodeId>().is_err());
        assert!(":1".parse::<LegacyNodeId>().is_err());
        assert!("host:x".parse::<LegacyNodeId>().is_err());
    }

    #[test]
    fn test_identity_equality_by_id() {
        let id = NodeId::new("aaa").unwrap();
        let a = NodeIdentity::new(id.clone(), "Node A");
        let b = NodeIdentity::new(id, "Renamed").with_workflow_host(true);
        assert_eq!(a, b);

        let c = NodeIdentity::new(NodeId::new("bbb").unwrap(), "Node A");
        assert_ne!(a, c);
    }

    #[test]
    fn test_identity_serde_defaults() {
        let json = r#"{"id":"aaa","display_name":"A"}"#;
        let identity: NodeIdentity = serde_json::from_str(json).unwrap();
        assert_eq!(identity.id.as_str(), "aaa");
        assert!(!identity.is_workflow_host);
        assert!(identity.public_key.is_none());

        let keyed = identity.with_public_key("ed25519:abc");
        let json = serde_json::to_string(&keyed).unwrap();
        assert!(json.contains("\"public_key\":\"ed25519:abc\""));
    }
}
