//! Routes command.

use std::sync::Arc;

use nodelink_ops::{DedupPolicy, DiscoveryReport, ReachabilityDiscovery, RoutedPeerLister};
use nodelink_types::NodeId;

use crate::config::CliConfig;
use crate::context::probe_node;
use crate::error::CliResult;
use crate::output::{OutputFormat, Render, RouteLine, RoutesOutput};

/// Execute the routes command.
///
/// Like `peers`, but keeps every route a node was reported on instead of
/// one entry per node.
pub async fn routes(config: CliConfig, format: OutputFormat, contact: &str) -> CliResult<String> {
    let node = probe_node(&config)?;

    let result = async {
        node.communication().add_runtime_peer(contact).await?;
        let lister = Arc::new(RoutedPeerLister::new(node.routing().clone()));
        let report = ReachabilityDiscovery::new(lister, DedupPolicy::ByRoute)
            .discover(node.identity())
            .await;
        CliResult::Ok(routes_output(contact, &report, &node.identity().id))
    }
    .await;

    node.shutdown().await;
    Ok(result?.render(format))
}

/// Routes as seen from a throwaway node at `local`: its own entry is
/// dropped and peers it reported are shown as direct.
fn routes_output(contact: &str, report: &DiscoveryReport, local: &NodeId) -> RoutesOutput {
    let routes = report
        .routes
        .iter()
        .filter(|r| r.node != *local)
        .map(|r| RouteLine {
            node: r.node.to_string(),
            via: r.via.as_ref().filter(|v| *v != local).map(ToString::to_string),
        })
        .collect();
    RoutesOutput {
        via: contact.to_string(),
        routes,
        unreachable: report.unreachable.iter().map(ToString::to_string).collect(),
        probes: report.probes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelink_ops::DiscoveredRoute;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn test_probe_node_hidden() {
        let report = DiscoveryReport {
            reachable: vec![],
            routes: vec![
                DiscoveredRoute { node: id("cli"), via: None },
                DiscoveredRoute { node: id("bbb"), via: Some(id("cli")) },
                DiscoveredRoute { node: id("ccc"), via: Some(id("bbb")) },
            ],
            unreachable: vec![id("ddd")],
            probes: 4,
        };

        let output = routes_output("virtual:b:1", &report, &id("cli"));
        assert_eq!(output.routes.len(), 2);
        assert_eq!(output.routes[0].node, "bbb");
        assert!(output.routes[0].via.is_none());
        assert_eq!(output.routes[1].via.as_deref(), Some("bbb"));
        assert_eq!(output.unreachable, vec!["ddd".to_string()]);
    }
}
