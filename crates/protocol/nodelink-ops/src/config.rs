//! Configuration types for the operations layer.
//!
//! This module defines how routes are looked up and how recursive
//! discovery treats nodes reached through more than one route.

use std::time::Duration;

use nodelink_types::constants::{DEFAULT_REQUEST_TIMEOUT_MS, FORWARDING_TIMEOUT_MS, MAX_HOP_COUNT};
use serde::{Deserialize, Serialize};

/// How the next hop towards a node is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Look the target up in the static contact map and talk to it directly.
    StaticContactMap,
    /// Shortest path over the topology learned from connections and discovery.
    #[default]
    DynamicDiscovery,
}

/// How recursive discovery deduplicates nodes.
///
/// One physical node can be reported by several peers. With
/// [`ByNodeId`](Self::ByNodeId) it is probed once per pass; with
/// [`ByRoute`](Self::ByRoute) every distinct route to it is recorded, so an
/// operator can see each way the node is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// One entry per node id.
    #[default]
    ByNodeId,
    /// One entry per (reporting node, node) pair.
    ByRoute,
}

/// Configuration for routing and discovery.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Next-hop strategy.
    pub strategy: RoutingStrategy,
    /// Discovery dedup policy.
    pub dedup: DedupPolicy,
    /// Routed requests with more hops than this are rejected.
    pub max_hop_count: u32,
    /// How long an intermediate node waits for the next hop.
    pub forwarding_timeout: Duration,
    /// How long discovery waits for one peer listing.
    pub probe_timeout: Duration,
    /// Default timeout for remote service calls.
    pub call_timeout: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::default(),
            dedup: DedupPolicy::default(),
            max_hop_count: MAX_HOP_COUNT,
            forwarding_timeout: Duration::from_millis(FORWARDING_TIMEOUT_MS),
            probe_timeout: Duration::from_millis(5_000),
            call_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

impl RoutingConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the next-hop strategy.
    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the discovery dedup policy.
    pub fn with_dedup(mut self, dedup: DedupPolicy) -> Self {
        self.dedup = dedup;
        self
    }

    /// Set the hop limit.
    pub fn with_max_hop_count(mut self, max_hop_count: u32) -> Self {
        self.max_hop_count = max_hop_count;
        self
    }

    /// Set the forwarding timeout.
    pub fn with_forwarding_timeout(mut self, timeout: Duration) -> Self {
        self.forwarding_timeout = timeout;
        self
    }

    /// Set the per-peer discovery timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the remote call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RoutingConfig::default();
        assert_eq!(config.strategy, RoutingStrategy::DynamicDiscovery);
        assert_eq!(config.dedup, DedupPolicy::ByNodeId);
        assert_eq!(config.max_hop_count, MAX_HOP_COUNT);
        assert_eq!(config.forwarding_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_builders() {
        let config = RoutingConfig::new()
            .with_strategy(RoutingStrategy::StaticContactMap)
            .with_dedup(DedupPolicy::ByRoute)
            .with_max_hop_count(4)
            .with_forwarding_timeout(Duration::from_secs(3))
            .with_probe_timeout(Duration::from_millis(200));
        assert_eq!(config.strategy, RoutingStrategy::StaticContactMap);
        assert_eq!(config.dedup, DedupPolicy::ByRoute);
        assert_eq!(config.max_hop_count, 4);
        assert_eq!(config.forwarding_timeout, Duration::from_secs(3));
        assert_eq!(config.probe_timeout, Duration::from_millis(200));
    }
}
