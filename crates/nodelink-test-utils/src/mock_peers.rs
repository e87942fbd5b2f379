//! Mock peer graph for discovery tests.
//!
//! Implements [`PeerLister`] over a fixed adjacency list, with configurable
//! failing nodes, an optional delay per listing and call counters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nodelink_ops::{OpsError, OpsResult, PeerLister};
use nodelink_types::{NodeId, NodeIdentity};

use crate::helpers::test_identity;

#[derive(Default)]
struct MockPeerGraphInner {
    identities: HashMap<NodeId, NodeIdentity>,
    links: HashMap<NodeId, Vec<NodeId>>,
    failing: Vec<NodeId>,
    calls: Vec<NodeId>,
}

/// A fixed peer graph. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MockPeerGraph {
    inner: Arc<Mutex<MockPeerGraphInner>>,
    delay: Option<Duration>,
}

impl MockPeerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the link `from -> to`, creating test identities as needed.
    pub fn with_link(self, from: &str, to: &str) -> Self {
        self.link(from, to);
        self
    }

    /// Make listings of `id` fail.
    pub fn with_failing(self, id: &str) -> Self {
        self.set_failing(id, true);
        self
    }

    /// Delay every listing by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Add the link `from -> to`.
    pub fn link(&self, from: &str, to: &str) {
        let mut inner = self.inner.lock().unwrap();
        for id in [from, to] {
            let identity = test_identity(id);
            inner.identities.entry(identity.id.clone()).or_insert(identity);
        }
        inner
            .links
            .entry(NodeId::new(from).unwrap())
            .or_default()
            .push(NodeId::new(to).unwrap());
    }

    /// Make listings of `id` fail or succeed again.
    pub fn set_failing(&self, id: &str, failing: bool) {
        let id = NodeId::new(id).unwrap();
        let mut inner = self.inner.lock().unwrap();
        inner.failing.retain(|f| *f != id);
        if failing {
            inner.failing.push(id);
        }
    }

    /// Identity of a node in the graph.
    pub fn identity(&self, id: &str) -> NodeIdentity {
        let id = NodeId::new(id).unwrap();
        self.inner
            .lock()
            .unwrap()
            .identities
            .get(&id)
            .cloned()
            .unwrap_or_else(|| NodeIdentity::new(id, ""))
    }

    /// Total number of listings requested.
    pub fn call_count(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }

    /// Number of listings requested for `id`.
    pub fn calls_for(&self, id: &str) -> usize {
        let id = NodeId::new(id).unwrap();
        self.inner.lock().unwrap().calls.iter().filter(|c| **c == id).count()
    }
}

#[async_trait]
impl PeerLister for MockPeerGraph {
    async fn list_peers(&self, node: &NodeIdentity) -> OpsResult<Vec<NodeIdentity>> {
        self.inner.lock().unwrap().calls.push(node.id.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let inner = self.inner.lock().unwrap();
        if inner.failing.contains(&node.id) {
            return Err(OpsError::NoRoute(node.id.clone()));
        }
        Ok(inner
            .links
            .get(&node.id)
            .map(|peers| {
                peers
                    .iter()
                    .filter_map(|p| inner.identities.get(p).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }
}
