//! Diagnostic commands against in-process broker nodes.

use std::time::Duration;

use nodelink_cli::commands::{peers, ping, routes};
use nodelink_cli::{CliConfig, CliError, OutputFormat};
use nodelink_ops::Node;
use nodelink_test_utils::{loopback_broker_contact, test_host_identity, test_identity, test_network_config, wait_until};
use nodelink_types::NetworkContactPoint;

async fn listening_node(id: &str) -> (Node, NetworkContactPoint) {
    let node = Node::builder(test_host_identity(id))
        .network_config(test_network_config())
        .listen_on(loopback_broker_contact())
        .build()
        .unwrap();
    let bound = node.start().await.unwrap().remove(0);
    (node, bound)
}

fn cli_config() -> CliConfig {
    let mut config = CliConfig::default();
    config.network.request_timeout_secs = 5;
    config.network.handshake_timeout_ms = 2_000;
    config
}

#[tokio::test]
async fn test_ping_reports_round_trips() {
    let (a, contact) = listening_node("aaa").await;

    let output = ping(cli_config(), OutputFormat::Json, &contact.to_string(), 3)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
    assert_eq!(parsed["node_id"], "aaa");
    assert_eq!(parsed["round_trips_ms"].as_array().unwrap().len(), 3);

    a.shutdown().await;
}

#[tokio::test]
async fn test_ping_without_server() {
    let (a, contact) = listening_node("aaa").await;
    a.shutdown().await;

    let result = ping(cli_config(), OutputFormat::Human, &contact.to_string(), 1).await;
    assert!(matches!(result, Err(CliError::Network(_))));
}

#[tokio::test]
async fn test_peers_and_routes_through_one_contact() {
    let (a, contact) = listening_node("aaa").await;
    let c = Node::builder(test_identity("ccc"))
        .network_config(test_network_config())
        .build()
        .unwrap();
    c.network().connect(&contact, true).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || async { a.network().connected_nodes().len() == 1 }).await);

    let output = peers(cli_config(), OutputFormat::Json, &contact.to_string(), false)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
    let ids: Vec<&str> = parsed["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["node_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["aaa", "ccc"]);

    let hosts = peers(cli_config(), OutputFormat::Json, &contact.to_string(), true)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&hosts).unwrap();
    assert_eq!(parsed["nodes"].as_array().unwrap().len(), 1);

    let output = routes(cli_config(), OutputFormat::Json, &contact.to_string())
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
    let routes = parsed["routes"].as_array().unwrap();
    assert!(routes
        .iter()
        .any(|r| r["node"] == "aaa" && r.get("via").is_none()));
    assert!(routes.iter().any(|r| r["node"] == "ccc" && r["via"] == "aaa"));

    c.shutdown().await;
    a.shutdown().await;
}
