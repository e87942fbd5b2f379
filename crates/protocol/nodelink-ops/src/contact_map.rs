//! Static contact map.
//!
//! Maps platforms, given in legacy `host:instance` form, to the
//! [`NetworkContact`] used to reach them, separately per
//! [`CommunicationType`]. A mapping is written as
//!
//! ```text
//! <host>:<instance>=<contact host>:<protocol>:<port>
//! ```
//!
//! where `<host>` is a host name, an address, a CIDR network such as
//! `192.168.0.0/24`, or `$host` for any host, and `<instance>` is an
//! instance number or `-1` for any instance. A `$host` contact host is
//! replaced by the host of the platform being looked up.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::RwLock;

use nodelink_types::{CommunicationType, LegacyNodeId, NetworkContact};
use tracing::warn;

use crate::error::{OpsError, OpsResult};

/// Placeholder standing for any host.
pub const HOST_VARIABLE: &str = "$host";

/// Instance number standing for any instance.
const ANY_INSTANCE: i64 = -1;

// =============================================================================
// Patterns
// =============================================================================

/// Host part of a platform pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// `$host`: matches every host, but only after all other entries.
    Any,
    /// A host name or address compared literally.
    Exact(String),
    /// An address network in CIDR notation.
    Network {
        /// Network address.
        address: IpAddr,
        /// Prefix length in bits.
        prefix: u8,
    },
}

impl HostPattern {
    /// Whether `host` is this host or lies in this network.
    ///
    /// [`HostPattern::Any`] matches nothing here; wildcard entries are
    /// consulted separately.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Any => false,
            Self::Exact(expected) => expected.eq_ignore_ascii_case(host),
            Self::Network { address, prefix } => match host.parse::<IpAddr>() {
                Ok(candidate) => in_network(candidate, *address, *prefix),
                Err(_) => false,
            },
        }
    }
}

impl FromStr for HostPattern {
    type Err = OpsError;

    fn from_str(s: &str) -> OpsResult<Self> {
        if s == HOST_VARIABLE {
            return Ok(Self::Any);
        }
        if s.is_empty() {
            return Err(OpsError::invalid_mapping(s, "empty host"));
        }
        let Some((address, prefix)) = s.split_once('/') else {
            return Ok(Self::Exact(s.to_string()));
        };

        let address: IpAddr = address
            .parse()
            .map_err(|_| OpsError::invalid_mapping(s, "network address is not an IP address"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| OpsError::invalid_mapping(s, "invalid prefix length"))?;
        let max = if address.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(OpsError::invalid_mapping(s, format!("prefix length above {}", max)));
        }
        Ok(Self::Network { address, prefix })
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str(HOST_VARIABLE),
            Self::Exact(host) => f.write_str(host),
            Self::Network { address, prefix } => write!(f, "{}/{}", address, prefix),
        }
    }
}

fn in_network(candidate: IpAddr, network: IpAddr, prefix: u8) -> bool {
    match (candidate, network) {
        (IpAddr::V4(c), IpAddr::V4(n)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(c) & mask == u32::from(n) & mask
        }
        (IpAddr::V6(c), IpAddr::V6(n)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(c) & mask == u128::from(n) & mask
        }
        _ => false,
    }
}

/// Left-hand side of a mapping: which platforms it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformPattern {
    /// Host part.
    pub host: HostPattern,
    /// Instance number, `None` for any.
    pub instance: Option<u32>,
}

impl PlatformPattern {
    pub fn new(host: HostPattern, instance: Option<u32>) -> Self {
        Self { host, instance }
    }

    fn matches_instance(&self, platform: &LegacyNodeId) -> bool {
        self.instance.map_or(true, |i| i == platform.instance)
    }
}

impl FromStr for PlatformPattern {
    type Err = OpsError;

    fn from_str(s: &str) -> OpsResult<Self> {
        let (host, instance) = s
            .rsplit_once(':')
            .ok_or_else(|| OpsError::invalid_mapping(s, "expected host:instance"))?;
        let instance: i64 = instance
            .trim()
            .parse()
            .map_err(|_| OpsError::invalid_mapping(s, "invalid instance number"))?;
        let instance = match instance {
            ANY_INSTANCE => None,
            n => Some(u32::try_from(n).map_err(|_| OpsError::invalid_mapping(s, "invalid instance number"))?),
        };
        Ok(Self::new(host.trim().parse()?, instance))
    }
}

impl fmt::Display for PlatformPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instance {
            Some(i) => write!(f, "{}:{}", self.host, i),
            None => write!(f, "{}:{}", self.host, ANY_INSTANCE),
        }
    }
}

/// Parse one `platform=contact` mapping.
pub fn parse_mapping(line: &str) -> OpsResult<(PlatformPattern, NetworkContact)> {
    let (target, contact) = line
        .split_once('=')
        .ok_or_else(|| OpsError::invalid_mapping(line, "expected <platform>=<contact>"))?;
    let pattern: PlatformPattern = target.trim().parse()?;

    let parts: Vec<&str> = contact.trim().split(':').collect();
    let [host, protocol, port] = parts.as_slice() else {
        return Err(OpsError::invalid_mapping(line, "contact must be host:protocol:port"));
    };
    let port: u16 = port
        .parse()
        .map_err(|_| OpsError::invalid_mapping(line, "invalid port"))?;
    if host.is_empty() || protocol.is_empty() {
        return Err(OpsError::invalid_mapping(line, "empty contact host or protocol"));
    }
    Ok((pattern, NetworkContact::new(*host, *protocol, port)))
}

// =============================================================================
// CommunicationContactMap
// =============================================================================

type Entries = Vec<(PlatformPattern, NetworkContact)>;

/// Platform-to-contact routes per communication type.
///
/// Owned by the node that uses it; several maps can coexist in one process.
#[derive(Debug, Default)]
pub struct CommunicationContactMap {
    entries: RwLock<HashMap<CommunicationType, Entries>>,
}

impl CommunicationContactMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load mappings from configuration lines.
    ///
    /// Invalid lines are logged and skipped. Returns the number loaded.
    pub fn load_mappings<I, S>(&self, communication_type: CommunicationType, lines: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut loaded = 0;
        for line in lines {
            match parse_mapping(line.as_ref()) {
                Ok((pattern, contact)) => {
                    self.set_mapping(communication_type, pattern, contact);
                    loaded += 1;
                }
                Err(e) => warn!(error = %e, "Invalid communication configuration"),
            }
        }
        loaded
    }

    /// Set the contact for `pattern`, replacing an existing one.
    pub fn set_mapping(&self, communication_type: CommunicationType, pattern: PlatformPattern, contact: NetworkContact) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let list = entries.entry(communication_type).or_default();
        match list.iter_mut().find(|(p, _)| *p == pattern) {
            Some(entry) => entry.1 = contact,
            None => list.push((pattern, contact)),
        }
    }

    /// Set several contacts at once.
    pub fn set_mappings<I>(&self, communication_type: CommunicationType, mappings: I)
    where
        I: IntoIterator<Item = (PlatformPattern, NetworkContact)>,
    {
        for (pattern, contact) in mappings {
            self.set_mapping(communication_type, pattern, contact);
        }
    }

    /// Remove the contact for `pattern`, returning it.
    pub fn remove_mapping(&self, communication_type: CommunicationType, pattern: &PlatformPattern) -> Option<NetworkContact> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let list = entries.get_mut(&communication_type)?;
        let index = list.iter().position(|(p, _)| p == pattern)?;
        Some(list.remove(index).1)
    }

    /// Remove every mapping of every communication type.
    pub fn remove_all_mappings(&self) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Mappings of one communication type in insertion order.
    pub fn mappings(&self, communication_type: CommunicationType) -> Vec<(PlatformPattern, NetworkContact)> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&communication_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Contact for `platform`.
    ///
    /// Host and network entries are consulted first, in insertion order;
    /// `$host` entries only when none of those match.
    pub fn get_contact(&self, communication_type: CommunicationType, platform: &LegacyNodeId) -> OpsResult<NetworkContact> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let list = entries
            .get(&communication_type)
            .ok_or_else(|| OpsError::NoContact(platform.to_string()))?;

        let direct = list
            .iter()
            .find(|(p, _)| p.host.matches(&platform.host) && p.matches_instance(platform));
        if let Some((_, contact)) = direct {
            return Ok(contact.clone());
        }

        list.iter()
            .find(|(p, _)| p.host == HostPattern::Any && p.matches_instance(platform))
            .map(|(_, contact)| {
                if contact.host == HOST_VARIABLE {
                    contact.with_host(platform.host.clone())
                } else {
                    contact.clone()
                }
            })
            .ok_or_else(|| OpsError::NoContact(platform.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RPC: &str = "broker";

    fn platform(host: &str, instance: u32) -> LegacyNodeId {
        LegacyNodeId::new(host, instance)
    }

    fn pattern(s: &str) -> PlatformPattern {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_mapping() {
        let (p, contact) = parse_mapping("192.168.0.100:1=127.0.0.1:broker:21000").unwrap();
        assert_eq!(p.host, HostPattern::Exact("192.168.0.100".into()));
        assert_eq!(p.instance, Some(1));
        assert_eq!(contact, NetworkContact::new("127.0.0.1", RPC, 21000));

        let (p, _) = parse_mapping("$host:-1=$host:broker:21000").unwrap();
        assert_eq!(p.host, HostPattern::Any);
        assert_eq!(p.instance, None);
        assert_eq!(p.to_string(), "$host:-1");
    }

    #[test]
    fn test_parse_mapping_errors() {
        for bad in [
            "no-equals",
            "host=127.0.0.1:broker:1",
            "host:x=127.0.0.1:broker:1",
            "host:1=127.0.0.1:broker",
            "host:1=127.0.0.1:broker:99999",
            "10.0.0.0/40:1=a:b:1",
            "host:-2=a:b:1",
        ] {
            assert!(parse_mapping(bad).is_err(), "{} should fail", bad);
        }
    }

    #[test]
    fn test_cidr_matching() {
        let net: HostPattern = "192.168.0.0/24".parse().unwrap();
        assert!(net.matches("192.168.0.100"));
        assert!(!net.matches("192.168.1.100"));
        assert!(!net.matches("some-host"));

        let all: HostPattern = "0.0.0.0/0".parse().unwrap();
        assert!(all.matches("10.1.2.3"));

        let v6: HostPattern = "fe80::/10".parse().unwrap();
        assert!(v6.matches("fe80::1"));
        assert!(!v6.matches("2001:db8::1"));
        assert!(!v6.matches("192.168.0.1"));
    }

    #[test]
    fn test_get_contact_exact_and_missing() {
        let map = CommunicationContactMap::new();
        let contact = NetworkContact::new("127.0.0.1", RPC, 1099);
        map.set_mapping(CommunicationType::ServiceCall, pattern("192.168.0.100:1"), contact.clone());

        assert_eq!(
            map.get_contact(CommunicationType::ServiceCall, &platform("192.168.0.100", 1)).unwrap(),
            contact
        );
        assert!(matches!(
            map.get_contact(CommunicationType::ServiceCall, &platform("192.168.0.100", 3)),
            Err(OpsError::NoContact(_))
        ));
        assert!(map
            .get_contact(CommunicationType::FileTransfer, &platform("192.168.0.100", 1))
            .is_err());
    }

    #[test]
    fn test_network_entry_any_instance() {
        let map = CommunicationContactMap::new();
        let contact = NetworkContact::new("gateway", RPC, 1099);
        map.set_mapping(CommunicationType::ServiceCall, pattern("192.168.0.0/24:-1"), contact.clone());

        assert_eq!(
            map.get_contact(CommunicationType::ServiceCall, &platform("192.168.0.7", 5)).unwrap(),
            contact
        );
    }

    #[test]
    fn test_wildcard_substitutes_host_and_comes_last() {
        let map = CommunicationContactMap::new();
        map.set_mapping(
            CommunicationType::ServiceCall,
            pattern("$host:1"),
            NetworkContact::new(HOST_VARIABLE, RPC, 1099),
        );
        let specific = NetworkContact::new("10.0.0.1", RPC, 2000);
        map.set_mapping(CommunicationType::ServiceCall, pattern("node-a:1"), specific.clone());

        assert_eq!(
            map.get_contact(CommunicationType::ServiceCall, &platform("node-a", 1)).unwrap(),
            specific
        );
        assert_eq!(
            map.get_contact(CommunicationType::ServiceCall, &platform("node-b", 1)).unwrap(),
            NetworkContact::new("node-b", RPC, 1099)
        );
        assert!(map
            .get_contact(CommunicationType::ServiceCall, &platform("node-b", 2))
            .is_err());
    }

    #[test]
    fn test_set_replaces_and_remove() {
        let map = CommunicationContactMap::new();
        let p = pattern("host:1");
        map.set_mapping(CommunicationType::ServiceCall, p.clone(), NetworkContact::new("a", RPC, 1));
        map.set_mappings(
            CommunicationType::ServiceCall,
            [
                (p.clone(), NetworkContact::new("b", RPC, 2)),
                (pattern("other:1"), NetworkContact::new("c", RPC, 3)),
            ],
        );
        assert_eq!(map.mappings(CommunicationType::ServiceCall).len(), 2);

        assert_eq!(
            map.remove_mapping(CommunicationType::ServiceCall, &p),
            Some(NetworkContact::new("b", RPC, 2))
        );
        assert_eq!(map.remove_mapping(CommunicationType::ServiceCall, &p), None);
        assert_eq!(map.remove_mapping(CommunicationType::FileTransfer, &p), None);
    }

    #[test]
    fn test_load_mappings_skips_invalid() {
        let map = CommunicationContactMap::new();
        let loaded = map.load_mappings(
            CommunicationType::FileTransfer,
            ["a:1=127.0.0.1:broker:1", "garbage", "b:-1=127.0.0.1:broker:2"],
        );
        assert_eq!(loaded, 2);
        map.remove_all_mappings();
        assert!(map.mappings(CommunicationType::FileTransfer).is_empty());
    }
}
