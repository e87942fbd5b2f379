//! Addressing value types.
//!
//! [`NetworkContact`] is the plain `{host, protocol, port}` triple used by
//! static contact maps. [`NetworkContactPoint`] is the descriptor a
//! transport provider listens on or connects to.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};

// =============================================================================
// NetworkContact
// =============================================================================

/// A `{host, protocol, port}` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkContact {
    pub host: String,
    pub protocol: String,
    pub port: u16,
}

impl NetworkContact {
    pub fn new(host: impl Into<String>, protocol: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            protocol: protocol.into(),
            port,
        }
    }

    /// Replace the host, keeping protocol and port.
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for NetworkContact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

impl FromStr for NetworkContact {
    type Err = TypesError;

    /// Parses `protocol://host:port` or `host:protocol:port`.
    fn from_str(s: &str) -> Result<Self> {
        if let Some((protocol, rest)) = s.split_once("://") {
            let (host, port) = split_host_port(rest).map_err(|r| TypesError::contact(s, r))?;
            if protocol.is_empty() {
                return Err(TypesError::contact(s, "empty protocol"));
            }
            return Ok(Self::new(host, protocol, port));
        }

        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [host, protocol, port] if !host.is_empty() && !protocol.is_empty() => {
                let port = parse_port(port).map_err(|r| TypesError::contact(s, r))?;
                Ok(Self::new(*host, *protocol, port))
            }
            _ => Err(TypesError::contact(s, "expected protocol://host:port or host:protocol:port")),
        }
    }
}

// =============================================================================
// NetworkContactPoint
// =============================================================================

/// Descriptor used by one transport provider to listen or connect.
///
/// Attributes are transport specific (for example a TLS flag) and are kept
/// sorted so that equal contact points display identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkContactPoint {
    pub transport_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl NetworkContactPoint {
    pub fn new(transport_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport_id: transport_id.into(),
            host: host.into(),
            port,
            attributes: BTreeMap::new(),
        }
    }

    /// Add a transport-specific attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Copy of this contact point with a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    /// `host:port` socket address string.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Key identifying the listening endpoint, ignoring attributes.
    pub fn endpoint_key(&self) -> String {
        format!("{}:{}:{}", self.transport_id, self.host, self.port)
    }
}

impl fmt::Display for NetworkContactPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.transport_id, self.host, self.port)?;
        if !self.attributes.is_empty() {
            let attrs: Vec<String> = self
                .attributes
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "({})", attrs.join(","))?;
        }
        Ok(())
    }
}

impl FromStr for NetworkContactPoint {
    type Err = TypesError;

    /// Parses `transport:host:port` or `transport://host:port`, optionally
    /// followed by `(key=value,...)`.
    fn from_str(s: &str) -> Result<Self> {
        let input = s.trim();
        let (address, attributes) = match input.find('(') {
            Some(open) => {
                let inner = input[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| TypesError::contact_point(s, "unterminated attribute list"))?;
                (&input[..open], parse_attributes(inner).map_err(|r| TypesError::contact_point(s, r))?)
            }
            None => (input, BTreeMap::new()),
        };

        let (transport_id, rest) = match address.split_once("://") {
            Some(parts) => parts,
            None => address
                .split_once(':')
                .ok_or_else(|| TypesError::contact_point(s, "missing transport id"))?,
        };
        if transport_id.is_empty() {
            return Err(TypesError::contact_point(s, "empty transport id"));
        }
        let (host, port) = split_host_port(rest).map_err(|r| TypesError::contact_point(s, r))?;

        Ok(Self {
            transport_id: transport_id.to_string(),
            host,
            port,
            attributes,
        })
    }
}

// =============================================================================
// CommunicationType
// =============================================================================

/// Kind of traffic a route is looked up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationType {
    /// Remote service invocation.
    ServiceCall,
    /// Bulk file transfer.
    FileTransfer,
}

impl CommunicationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceCall => "service_call",
            Self::FileTransfer => "file_transfer",
        }
    }
}

impl fmt::Display for CommunicationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommunicationType {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "service_call" | "servicecall" => Ok(Self::ServiceCall),
            "file_transfer" | "filetransfer" => Ok(Self::FileTransfer),
            _ => Err(TypesError::UnknownCommunicationType(s.to_string())),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn split_host_port(s: &str) -> std::result::Result<(String, u16), String> {
    let (host, port) = s.rsplit_once(':').ok_or("missing port")?;
    if host.is_empty() {
        return Err("empty host".to_string());
    }
    Ok((host.to_string(), parse_port(port)?))
}

fn parse_port(port: &str) -> std::result::Result<u16, String> {
    port.parse()
        .map_err(|_| format!("invalid port {:?}", port))
}

fn parse_attributes(inner: &str) -> std::result::Result<BTreeMap<String, String>, String> {
    let mut attributes = BTreeMap::new();
    for pair in inner.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("attribute {:?} is not key=value", pair))?;
        attributes.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(attributes)
}
