//! Network state model.
//!
//! A snapshot of the reachable nodes keyed by node id, as shown to users.
//! Models are rebuilt, never patched: after a topology change any model
//! obtained earlier is stale.

use std::collections::BTreeMap;

use nodelink_types::{NodeId, NodeIdentity};
use serde::Serialize;

/// Name shown for nodes that never told us theirs.
pub const UNKNOWN_DISPLAY_NAME: &str = "<unknown>";

/// One node of the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkStateNode {
    pub node_id: NodeId,
    pub display_name: String,
    pub is_workflow_host: bool,
    pub is_local_node: bool,
}

impl NetworkStateNode {
    fn from_identity(identity: &NodeIdentity, local: &NodeId) -> Self {
        let display_name = if identity.display_name.is_empty() {
            UNKNOWN_DISPLAY_NAME.to_string()
        } else {
            identity.display_name.clone()
        };
        Self {
            node_id: identity.id.clone(),
            display_name,
            is_workflow_host: identity.is_workflow_host,
            is_local_node: identity.id == *local,
        }
    }
}

/// Reachable nodes keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStateModel {
    nodes: BTreeMap<NodeId, NetworkStateNode>,
}

impl NetworkStateModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a model from reachable identities, flagging `local`.
    pub fn from_identities<'a, I>(identities: I, local: &NodeId) -> Self
    where
        I: IntoIterator<Item = &'a NodeIdentity>,
    {
        let nodes = identities
            .into_iter()
            .map(|i| (i.id.clone(), NetworkStateNode::from_identity(i, local)))
            .collect();
        Self { nodes }
    }

    pub fn add_node(&mut self, node: NetworkStateNode) {
        self.nodes.insert(node.node_id.clone(), node);
    }

    pub fn node(&self, id: &NodeId) -> Option<&NetworkStateNode> {
        self.nodes.get(id)
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NetworkStateNode> {
        self.nodes.values()
    }

    pub fn local_node(&self) -> Option<&NetworkStateNode> {
        self.nodes.values().find(|n| n.is_local_node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of the nodes in the model.
    ///
    /// With `restrict_to_workflow_hosts_and_self`, only workflow hosts and
    /// the local node.
    pub fn get_reachable_nodes(&self, restrict_to_workflow_hosts_and_self: bool) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| !restrict_to_workflow_hosts_and_self || n.is_workflow_host || n.is_local_node)
            .map(|n| n.node_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, name: &str, host: bool) -> NodeIdentity {
        NodeIdentity::new(NodeId::new(id).unwrap(), name).with_workflow_host(host)
    }

    #[test]
    fn test_model_from_identities() {
        let local = NodeId::new("aaa").unwrap();
        let nodes = [
            identity("aaa", "Local", false),
            identity("bbb", "Host", true),
            identity("ccc", "", false),
        ];
        let model = NetworkStateModel::from_identities(&nodes, &local);

        assert_eq!(model.len(), 3);
        assert_eq!(model.local_node().unwrap().node_id, local);
        assert_eq!(
            model.node(&NodeId::new("ccc").unwrap()).unwrap().display_name,
            UNKNOWN_DISPLAY_NAME
        );
        assert_eq!(
            model.get_reachable_nodes(true),
            vec![NodeId::new("aaa").unwrap(), NodeId::new("bbb").unwrap()]
        );
        assert_eq!(model.get_reachable_nodes(false).len(), 3);
    }

    #[test]
    fn test_empty_model() {
        let model = NetworkStateModel::new();
        assert!(model.is_empty());
        assert!(model.local_node().is_none());
        assert!(model.get_reachable_nodes(false).is_empty());
    }

    #[test]
    fn test_serializes_to_json() {
        let local = NodeId::new("aaa").unwrap();
        let model = NetworkStateModel::from_identities(&[identity("aaa", "A", true)], &local);
        let json = serde_json::to_value(&model).unwrap();
        assert_eq!(json["nodes"]["aaa"]["is_local_node"], true);
    }
}
