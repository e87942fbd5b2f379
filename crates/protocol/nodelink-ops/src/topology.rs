//! Directed node graph.
//!
//! A link `a -> b` means `a` can send requests to `b`. The local node's
//! links come from its open connections; other nodes' links come from
//! what they report during discovery.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use nodelink_types::{NodeId, NodeIdentity};

/// Known nodes and the links between them.
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    nodes: HashMap<NodeId, NodeIdentity>,
    links: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl TopologyGraph {
    /// A graph holding only `local`.
    pub fn new(local: NodeIdentity) -> Self {
        let mut graph = Self::default();
        graph.add_node(local);
        graph
    }

    /// Add or update a node. Returns true if anything changed.
    pub fn add_node(&mut self, identity: NodeIdentity) -> bool {
        match self.nodes.get(&identity.id) {
            Some(existing)
                if existing.display_name == identity.display_name
                    && existing.is_workflow_host == identity.is_workflow_host =>
            {
                false
            }
            _ => {
                self.nodes.insert(identity.id.clone(), identity);
                true
            }
        }
    }

    /// Remove a node and every link touching it.
    pub fn remove_node(&mut self, id: &NodeId) -> bool {
        let removed = self.nodes.remove(id).is_some();
        self.links.remove(id);
        for targets in self.links.values_mut() {
            targets.remove(id);
        }
        removed
    }

    /// Replace the outgoing links of `from`. Returns true if they changed.
    pub fn set_links<I>(&mut self, from: &NodeId, targets: I) -> bool
    where
        I: IntoIterator<Item = NodeId>,
    {
        let targets: BTreeSet<NodeId> = targets.into_iter().filter(|t| t != from).collect();
        let current = self.links.get(from);
        if current == Some(&targets) || (current.is_none() && targets.is_empty()) {
            return false;
        }
        if targets.is_empty() {
            self.links.remove(from);
        } else {
            self.links.insert(from.clone(), targets);
        }
        true
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeIdentity> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// All known nodes, sorted by id.
    pub fn nodes(&self) -> Vec<NodeIdentity> {
        let mut nodes: Vec<NodeIdentity> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Direct successors of `from`.
    pub fn neighbors(&self, from: &NodeId) -> Vec<NodeId> {
        self.links
            .get(from)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.values().map(BTreeSet::len).sum()
    }

    /// Shortest path from `from` to `to`, both included.
    ///
    /// Ties are broken by node id, so equal graphs yield equal paths.
    pub fn shortest_path(&self, from: &NodeId, to: &NodeId) -> Option<Vec<NodeId>> {
        if from == to {
            return Some(vec![from.clone()]);
        }
        let mut previous: HashMap<NodeId, NodeId> = HashMap::new();
        let mut queue = VecDeque::from([from.clone()]);

        while let Some(current) = queue.pop_front() {
            for next in self.links.get(&current).into_iter().flatten() {
                if next == from || previous.contains_key(next) {
                    continue;
                }
                previous.insert(next.clone(), current.clone());
                if next == to {
                    let mut path = vec![to.clone()];
                    let mut cursor = to;
                    while let Some(p) = previous.get(cursor) {
                        path.push(p.clone());
                        cursor = p;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next.clone());
            }
        }
        None
    }

    /// Ids of nodes reachable from `from`, including `from`, sorted.
    pub fn reachable_from(&self, from: &NodeId) -> Vec<NodeId> {
        let mut seen = BTreeSet::from([from.clone()]);
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(current) = queue.pop_front() {
            for next in self.links.get(&current).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        seen.into_iter().collect()
    }

    /// One line per node with its links, for diagnostics.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "{} node(s), {} link(s)",
            self.node_count(),
            self.link_count()
        )];
        for node in self.nodes() {
            let targets: Vec<String> = self.neighbors(&node.id).iter().map(|t| t.to_string()).collect();
            lines.push(format!(
                "  {} [{}] -> {}",
                node.id,
                node.display_name,
                if targets.is_empty() { "-".to_string() } else { targets.join(", ") }
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn node(s: &str) -> NodeIdentity {
        NodeIdentity::new(id(s), s.to_uppercase())
    }

    fn chain() -> TopologyGraph {
        let mut graph = TopologyGraph::new(node("aaa"));
        for n in ["bbb", "ccc", "ddd"] {
            graph.add_node(node(n));
        }
        graph.set_links(&id("aaa"), [id("bbb")]);
        graph.set_links(&id("bbb"), [id("aaa"), id("ccc")]);
        graph.set_links(&id("ccc"), [id("ddd")]);
        graph
    }

    #[test]
    fn test_shortest_path() {
        let graph = chain();
        assert_eq!(
            graph.shortest_path(&id("aaa"), &id("ddd")).unwrap(),
            vec![id("aaa"), id("bbb"), id("ccc"), id("ddd")]
        );
        assert_eq!(graph.shortest_path(&id("aaa"), &id("aaa")).unwrap(), vec![id("aaa")]);
        assert!(graph.shortest_path(&id("ddd"), &id("aaa")).is_none());
    }

    #[test]
    fn test_shortest_path_prefers_fewer_hops() {
        let mut graph = chain();
        graph.set_links(&id("aaa"), [id("bbb"), id("ccc")]);
        assert_eq!(
            graph.shortest_path(&id("aaa"), &id("ddd")).unwrap(),
            vec![id("aaa"), id("ccc"), id("ddd")]
        );
    }

    #[test]
    fn test_reachable_with_cycle() {
        let graph = chain();
        assert_eq!(
            graph.reachable_from(&id("aaa")),
            vec![id("aaa"), id("bbb"), id("ccc"), id("ddd")]
        );
        assert_eq!(graph.reachable_from(&id("ddd")), vec![id("ddd")]);
    }

    #[test]
    fn test_set_links_change_detection() {
        let mut graph = chain();
        assert!(!graph.set_links(&id("aaa"), [id("bbb")]));
        assert!(graph.set_links(&id("aaa"), Vec::new()));
        assert!(!graph.set_links(&id("aaa"), Vec::new()));
        assert!(!graph.set_links(&id("eee"), [id("eee")]));
    }

    #[test]
    fn test_remove_node_drops_links() {
        let mut graph = chain();
        assert!(graph.remove_node(&id("ccc")));
        assert_eq!(graph.neighbors(&id("bbb")), vec![id("aaa")]);
        assert_eq!(graph.link_count(), 2);
        assert!(!graph.remove_node(&id("ccc")));
    }

    #[test]
    fn test_add_node_change_detection() {
        let mut graph = chain();
        assert!(!graph.add_node(node("bbb")));
        assert!(graph.add_node(node("bbb").with_workflow_host(true)));
        assert!(graph.summary().starts_with("4 node(s), 4 link(s)"));
    }
}
