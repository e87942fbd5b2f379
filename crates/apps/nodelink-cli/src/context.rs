//! Node context for CLI operations.

use nodelink_ops::Node;
use nodelink_store::{read_or_generate_node_id, NodeStore, NodeStoreConfig, SettingsStore, PERSISTENT_ID_KEY};
use nodelink_types::{NodeId, NodeIdentity};

use crate::config::CliConfig;
use crate::error::{CliError, CliResult};

/// Display name of the short-lived node used by diagnostic commands.
pub const PROBE_DISPLAY_NAME: &str = "nodelink-cli";

/// Whether `init` has run for the configured data directory.
pub fn is_initialized(config: &CliConfig) -> bool {
    NodeStoreConfig::new(config.data_dir()).database_path().exists()
}

/// Initialized local state of a node.
pub struct NodeContext {
    /// Settings store.
    pub store: NodeStore,
    /// The node's identity.
    pub identity: NodeIdentity,
    /// Configuration.
    pub config: CliConfig,
}

impl NodeContext {
    /// Open the node's state. The node must have been initialized.
    pub fn local(config: CliConfig) -> CliResult<Self> {
        if !is_initialized(&config) {
            return Err(CliError::NotInitialized);
        }
        let store = NodeStore::open(NodeStoreConfig::new(config.data_dir()))?;
        if store.settings.get(PERSISTENT_ID_KEY)?.is_none() && config.node.node_id.is_none() {
            return Err(CliError::NotInitialized);
        }
        Self::with_store(config, store)
    }

    /// Create the node's state, generating the persistent id.
    pub fn for_init(config: CliConfig) -> CliResult<Self> {
        let store = NodeStore::open(NodeStoreConfig::new(config.data_dir()))?;
        Self::with_store(config, store)
    }

    fn with_store(config: CliConfig, store: NodeStore) -> CliResult<Self> {
        let id = read_or_generate_node_id(&store.settings, config.node.node_id.as_deref())?;
        let mut identity =
            NodeIdentity::new(id, config.node.display_name.clone()).with_workflow_host(config.node.workflow_host);
        if let Some(legacy) = config.legacy_id()? {
            identity = identity.with_legacy_id(legacy);
        }
        Ok(Self {
            store,
            identity,
            config,
        })
    }

    /// Assemble the node described by the configuration.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build_node(&self) -> CliResult<Node> {
        build_node(self.identity.clone(), &self.config)
    }
}

/// Assemble a node for `identity` from `config`.
pub fn build_node(identity: NodeIdentity, config: &CliConfig) -> CliResult<Node> {
    let mut builder = Node::builder(identity)
        .network_config(config.network_config())
        .routing_config(config.routing_config())
        .connect_delay(config.connect_delay());
    if let Some(listen) = config.listen_contact_point() {
        builder = builder.listen_on(listen);
    }
    for contact_point in config.static_contact_points()? {
        builder = builder.static_contact(contact_point);
    }
    for (communication_type, line) in config.contact_mappings() {
        builder = builder.contact_mapping(communication_type, line);
    }
    Ok(builder.build()?)
}

/// A client-only node with a fresh id, for diagnostic commands.
///
/// It does not listen, does not connect to static contacts and does not
/// run health checks.
pub fn probe_node(config: &CliConfig) -> CliResult<Node> {
    let identity = NodeIdentity::new(NodeId::generate(), PROBE_DISPLAY_NAME);
    let mut probe_config = config.clone();
    probe_config.network.port = None;
    probe_config.network.static_contacts.clear();
    probe_config.network.health_checks = false;
    build_node(identity, &probe_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> CliConfig {
        let mut config = CliConfig::default();
        config.storage.data_dir = Some(temp_dir.path().join("data"));
        config
    }

    #[test]
    fn test_local_requires_init() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        assert!(!is_initialized(&config));
        assert!(matches!(NodeContext::local(config.clone()), Err(CliError::NotInitialized)));

        let created = NodeContext::for_init(config.clone()).unwrap();
        assert!(is_initialized(&config));
        drop(created);

        let opened = NodeContext::local(config).unwrap();
        assert!(opened.identity.id.is_persistent_format());
    }

    #[test]
    fn test_identity_from_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        config.node.display_name = "Build Server".into();
        config.node.workflow_host = true;
        config.node.legacy_id = Some("10.0.0.5:2".into());
        config.node.node_id = Some("0123456789abcdef0123456789abcdef".into());

        let ctx = NodeContext::for_init(config).unwrap();
        assert_eq!(ctx.identity.id.as_str(), "0123456789abcdef0123456789abcdef");
        assert_eq!(ctx.identity.display_name, "Build Server");
        assert!(ctx.identity.is_workflow_host);
        assert_eq!(ctx.identity.legacy_id.as_ref().unwrap().instance, 2);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        config.node.node_id = Some("not-hex".into());
        assert!(matches!(NodeContext::for_init(config), Err(CliError::Store(_))));
    }

    #[tokio::test]
    async fn test_probe_node_is_client_only() {
        let config = CliConfig::default();
        let node = probe_node(&config).unwrap();
        assert_eq!(node.identity().display_name, PROBE_DISPLAY_NAME);
        assert!(node.static_contacts().is_empty());
        assert!(node.start().await.unwrap().is_empty());
        node.shutdown().await;
    }
}
