//! CLI configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nodelink_net::{HealthCheckConfig, NetworkConfig};
use nodelink_ops::{DedupPolicy, RoutingConfig, RoutingStrategy};
use nodelink_types::constants::{
    DEFAULT_BIND_ADDRESS, DEFAULT_BROKER_PORT, DEFAULT_EXTERNAL_ADDRESS, DEFAULT_WORKER_POOL_SIZE,
    HANDSHAKE_TIMEOUT_MS, MAX_HOP_COUNT, STARTUP_CONNECT_DELAY_MS,
};
use nodelink_types::{CommunicationType, LegacyNodeId, NetworkContactPoint};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CliError, CliResult};

/// Expand environment variables in a string.
/// Supports `${VAR_NAME}` syntax; unset variables are left as-is.
fn expand_env_vars(input: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .to_string()
}

/// Get the default configuration file path.
pub fn default_config_path() -> PathBuf {
    nodelink_store::default_data_dir().join("config.toml")
}

/// CLI configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node identity configuration.
    pub node: NodeSection,
    /// Network configuration.
    pub network: NetworkSection,
    /// Routing configuration.
    pub routing: RoutingSection,
    /// Storage configuration.
    pub storage: StorageSection,
}

impl CliConfig {
    /// Load configuration from a file, or defaults if it does not exist.
    ///
    /// Environment variables in `${VAR}` form are expanded in contact
    /// strings and contact mappings.
    pub fn load(path: &Path) -> CliResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;

        for contact in &mut config.network.static_contacts {
            *contact = expand_env_vars(contact);
        }
        for mapping in config
            .routing
            .service_call
            .iter_mut()
            .chain(config.routing.file_transfer.iter_mut())
        {
            *mapping = expand_env_vars(mapping);
        }

        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> CliResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| CliError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Directory holding the node's database.
    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(nodelink_store::default_data_dir)
    }

    /// Contact point the node serves, if it listens at all.
    ///
    /// An empty bind address falls back to `0.0.0.0`.
    pub fn listen_contact_point(&self) -> Option<NetworkContactPoint> {
        let port = self.network.port?;
        let host = non_empty_or(&self.network.bind_address, DEFAULT_BIND_ADDRESS);
        Some(NetworkContactPoint::new(self.network.transport.clone(), host, port))
    }

    /// `contact_point` as other nodes should dial it.
    ///
    /// Wildcard hosts are replaced with the external address, which falls
    /// back to `127.0.0.1`.
    pub fn advertised(&self, contact_point: &NetworkContactPoint) -> NetworkContactPoint {
        if contact_point.host != DEFAULT_BIND_ADDRESS && contact_point.host != "::" {
            return contact_point.clone();
        }
        NetworkContactPoint {
            host: non_empty_or(&self.network.external_address, DEFAULT_EXTERNAL_ADDRESS),
            ..contact_point.clone()
        }
    }

    /// Parsed static contacts.
    pub fn static_contact_points(&self) -> CliResult<Vec<NetworkContactPoint>> {
        self.network
            .static_contacts
            .iter()
            .map(|s| s.parse().map_err(CliError::from))
            .collect()
    }

    /// Parsed legacy `host:instance` id, if configured.
    pub fn legacy_id(&self) -> CliResult<Option<LegacyNodeId>> {
        match self.node.legacy_id.as_deref() {
            Some(raw) if !raw.is_empty() => Ok(Some(raw.parse()?)),
            _ => Ok(None),
        }
    }

    /// Static contact map lines per communication type.
    pub fn contact_mappings(&self) -> Vec<(CommunicationType, String)> {
        let service_call = self
            .routing
            .service_call
            .iter()
            .map(|line| (CommunicationType::ServiceCall, line.clone()));
        let file_transfer = self
            .routing
            .file_transfer
            .iter()
            .map(|line| (CommunicationType::FileTransfer, line.clone()));
        service_call.chain(file_transfer).collect()
    }

    /// Connection layer configuration.
    pub fn network_config(&self) -> NetworkConfig {
        let health_check = if self.network.health_checks {
            HealthCheckConfig::default()
        } else {
            HealthCheckConfig::disabled()
        };
        NetworkConfig::default()
            .with_handshake_timeout(Duration::from_millis(self.network.handshake_timeout_ms))
            .with_request_timeout(Duration::from_secs(self.network.request_timeout_secs))
            .with_worker_pool_size(self.network.worker_pool_size)
            .with_health_check(health_check)
    }

    /// Routing configuration.
    pub fn routing_config(&self) -> RoutingConfig {
        RoutingConfig::default()
            .with_strategy(self.routing.strategy)
            .with_dedup(self.routing.dedup)
            .with_max_hop_count(self.routing.max_hop_count)
    }

    /// Delay before static contacts are connected.
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.network.connect_delay_ms)
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.trim().to_string()
    }
}

/// `[node]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Name shown to other nodes.
    pub display_name: String,
    /// Whether this node hosts workflows.
    pub workflow_host: bool,
    /// Fixed node id (32 lowercase hex digits) overriding the stored one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Legacy `host:instance` id used by static contact maps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_id: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            display_name: "nodelink node".to_string(),
            workflow_host: false,
            node_id: None,
            legacy_id: None,
        }
    }
}

/// `[network]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Transport used to serve.
    pub transport: String,
    /// Address to bind; empty means all interfaces.
    pub bind_address: String,
    /// Address advertised for wildcard binds; empty means loopback.
    pub external_address: String,
    /// Port to serve on; absent for a client-only node, 0 for any free port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Contact points connected to after startup.
    pub static_contacts: Vec<String>,
    /// Delay before static contacts are connected (milliseconds).
    pub connect_delay_ms: u64,
    /// Handshake timeout (milliseconds).
    pub handshake_timeout_ms: u64,
    /// Default request timeout (seconds).
    pub request_timeout_secs: u64,
    /// Whether outgoing connections are health checked.
    pub health_checks: bool,
    /// Concurrent dispatch limit.
    pub worker_pool_size: usize,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            transport: nodelink_net::BROKER_TRANSPORT_ID.to_string(),
            bind_address: String::new(),
            external_address: String::new(),
            port: Some(DEFAULT_BROKER_PORT),
            static_contacts: Vec::new(),
            connect_delay_ms: STARTUP_CONNECT_DELAY_MS,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            request_timeout_secs: 30,
            health_checks: true,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
        }
    }
}

/// `[routing]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    /// Next-hop strategy.
    pub strategy: RoutingStrategy,
    /// Discovery dedup policy.
    pub dedup: DedupPolicy,
    /// Maximum hops of a routed request.
    pub max_hop_count: u32,
    /// `host:instance=host:protocol:port` lines for service calls.
    pub service_call: Vec<String>,
    /// `host:instance=host:protocol:port` lines for file transfer.
    pub file_transfer: Vec<String>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::default(),
            dedup: DedupPolicy::default(),
            max_hop_count: MAX_HOP_COUNT,
            service_call: Vec::new(),
            file_transfer: Vec::new(),
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Data directory; defaults to the platform data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert_eq!(config.network.transport, "broker");
        assert_eq!(config.network.port, Some(21_000));
        assert_eq!(config.network.connect_delay_ms, 2_500);
        assert_eq!(config.routing.strategy, RoutingStrategy::DynamicDiscovery);
        assert!(config.network.health_checks);
    }

    #[test]
    fn test_listen_address_fallbacks() {
        let mut config = CliConfig::default();
        let listen = config.listen_contact_point().unwrap();
        assert_eq!(listen.to_string(), "broker:0.0.0.0:21000");
        assert_eq!(config.advertised(&listen).to_string(), "broker:127.0.0.1:21000");

        config.network.external_address = "node1.example.org".into();
        assert_eq!(config.advertised(&listen).host, "node1.example.org");

        config.network.bind_address = "10.0.0.5".into();
        let listen = config.listen_contact_point().unwrap();
        assert_eq!(config.advertised(&listen).host, "10.0.0.5");

        config.network.port = None;
        assert!(config.listen_contact_point().is_none());
    }

    #[test]
    fn test_parse_sections() {
        let config: CliConfig = toml::from_str(
            r#"
            [node]
            display_name = "Build Server"
            workflow_host = true
            legacy_id = "10.0.0.5:1"

            [network]
            port = 0
            static_contacts = ["broker:10.0.0.6:21000"]
            health_checks = false

            [routing]
            strategy = "static_contact_map"
            dedup = "by_route"
            service_call = ["$host:-1=$host:broker:21000"]
            "#,
        )
        .unwrap();

        assert!(config.node.workflow_host);
        assert_eq!(config.legacy_id().unwrap(), Some(LegacyNodeId::new("10.0.0.5", 1)));
        assert_eq!(config.static_contact_points().unwrap()[0].port, 21_000);
        assert!(!config.network_config().health_check.enabled);

        let routing = config.routing_config();
        assert_eq!(routing.strategy, RoutingStrategy::StaticContactMap);
        assert_eq!(routing.dedup, DedupPolicy::ByRoute);
        assert_eq!(
            config.contact_mappings(),
            vec![(CommunicationType::ServiceCall, "$host:-1=$host:broker:21000".to_string())]
        );
        // Unset sections keep their defaults
        assert_eq!(config.network.transport, "broker");
    }

    #[test]
    fn test_invalid_static_contact() {
        let mut config = CliConfig::default();
        config.network.static_contacts = vec!["not a contact".into()];
        assert!(matches!(config.static_contact_points(), Err(CliError::Types(_))));
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut config = CliConfig::default();
        config.node.display_name = "Roundtrip".into();
        config.storage.data_dir = Some(temp_dir.path().to_path_buf());
        config.save(&config_path).unwrap();

        let loaded = CliConfig::load(&config_path).unwrap();
        assert_eq!(loaded.node.display_name, "Roundtrip");
        assert_eq!(loaded.data_dir(), temp_dir.path());
        assert_eq!(loaded.network.port, config.network.port);
    }

    #[test]
    fn test_config_load_nonexistent_returns_default() {
        let path = Path::new("/tmp/nodelink_nonexistent_12345/config.toml");
        let config = CliConfig::load(path).unwrap();
        assert_eq!(config.node.display_name, CliConfig::default().node.display_name);
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("NODELINK_TEST_RELAY", "relay.example.org");

        assert_eq!(super::expand_env_vars("${NODELINK_TEST_RELAY}"), "relay.example.org");
        assert_eq!(
            super::expand_env_vars("broker:${NODELINK_TEST_RELAY}:21000"),
            "broker:relay.example.org:21000"
        );
        // Unset variable should remain as-is
        assert_eq!(
            super::expand_env_vars("${NODELINK_NONEXISTENT_12345}"),
            "${NODELINK_NONEXISTENT_12345}"
        );

        std::env::remove_var("NODELINK_TEST_RELAY");
    }

    #[test]
    fn test_load_expands_contacts() {
        std::env::set_var("NODELINK_TEST_PEER_HOST", "10.9.8.7");
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[network]\nstatic_contacts = [\"broker:${NODELINK_TEST_PEER_HOST}:21000\"]\n",
        )
        .unwrap();

        let config = CliConfig::load(&path).unwrap();
        assert_eq!(config.network.static_contacts, vec!["broker:10.9.8.7:21000".to_string()]);
        std::env::remove_var("NODELINK_TEST_PEER_HOST");
    }
}
