//! Routing, discovery and the communication facade for nodelink.
//!
//! This crate sits on top of the connection layer in `nodelink-net` and
//! turns a set of point-to-point connections into a network of nodes that
//! can reach each other over several hops.
//!
//! # Module Organization
//!
//! - [`node`] - [`Node`] and [`NodeBuilder`], the per-node application context
//! - [`facade`] - [`CommunicationService`], the API used by the platform
//! - [`routing`] - Topology view, next-hop lookup and routed delivery
//! - [`topology`] - Directed node graph with shortest paths
//! - [`contact_map`] - Static contact map with CIDR-aware host patterns
//! - [`discovery`] - Recursive reachability discovery and peer listing
//! - [`cache`] - Single-flight topology cache
//! - [`state`] - Network state model shown to users
//! - [`services`] - Service registry, remote calls and proxies
//! - [`config`] - Routing configuration
//! - [`error`] - Error types
//!
//! # Routing Strategies
//!
//! - **StaticContactMap**: the target's legacy `host:instance` id is looked
//!   up in the [`CommunicationContactMap`] and the contact is connected to
//! - **DynamicDiscovery**: the shortest known path through the topology
//!   graph, which is fed by connection events and peer listings
//!
//! # Example
//!
//! ```no_run
//! use nodelink_net::VirtualNetwork;
//! use nodelink_ops::Node;
//! use nodelink_types::{NetworkContactPoint, NodeId, NodeIdentity};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let net = VirtualNetwork::new();
//!     let a = Node::builder(NodeIdentity::new(NodeId::new("aaa")?, "A"))
//!         .virtual_network(net.clone())
//!         .listen_on(NetworkContactPoint::new("virtual", "a", 1))
//!         .build()?;
//!     let b = Node::builder(NodeIdentity::new(NodeId::new("bbb")?, "B").with_workflow_host(true))
//!         .virtual_network(net)
//!         .build()?;
//!     a.start().await?;
//!
//!     b.communication().add_runtime_peer("virtual:a:1").await?;
//!     for node in b.communication().get_available_nodes(true).await {
//!         println!("{} ({})", node.display_name, node.id);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod contact_map;
pub mod discovery;
pub mod error;
pub mod facade;
pub mod node;
pub mod routing;
pub mod services;
pub mod state;
pub mod topology;

pub use cache::{TopologyCache, TopologySnapshot, TopologySource};
pub use config::{DedupPolicy, RoutingConfig, RoutingStrategy};
pub use contact_map::{parse_mapping, CommunicationContactMap, HostPattern, PlatformPattern, HOST_VARIABLE};
pub use discovery::{
    list_peers_request, DiscoveredRoute, DiscoveryReport, PeerLister, PeerListingHandler, ReachabilityDiscovery,
    RoutedPeerLister,
};
pub use error::{OpsError, OpsResult};
pub use facade::{CommunicationService, DiscoverySource, ReachabilityChecker};
pub use node::{Node, NodeBuilder};
pub use routing::{
    is_routed, topics, NextHop, RoutingService, TopologyChange, TopologyChangeCause, ROUTED_TYPE, ROUTE_PATH_KEY,
};
pub use services::{
    RemoteServiceProxy, Service, ServiceCall, ServiceCallHandler, ServiceProperties, ServiceRegistry,
};
pub use state::{NetworkStateModel, NetworkStateNode, UNKNOWN_DISPLAY_NAME};
pub use topology::TopologyGraph;
