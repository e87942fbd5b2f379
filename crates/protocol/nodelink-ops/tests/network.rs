//! Multi-node tests over the in-process transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodelink_net::VirtualNetwork;
use nodelink_ops::{
    Node, OpsError, OpsResult, ReachabilityChecker, RoutingConfig, RoutingStrategy, Service, ServiceProperties,
    TopologyChangeCause,
};
use nodelink_test_utils::{test_host_identity, test_identity, test_network_config, virtual_contact, wait_until};
use nodelink_types::{CommunicationType, LegacyNodeId, NodeId, NodeIdentity, ResultCode};

struct Echo;

#[async_trait]
impl Service for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, method: &str, payload: &[u8]) -> OpsResult<Vec<u8>> {
        let mut out = method.as_bytes().to_vec();
        out.push(b':');
        out.extend_from_slice(payload);
        Ok(out)
    }
}

fn id(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

fn node(identity: NodeIdentity, net: &VirtualNetwork) -> nodelink_ops::NodeBuilder {
    Node::builder(identity)
        .network_config(test_network_config())
        .routing_config(
            RoutingConfig::default()
                .with_probe_timeout(Duration::from_secs(2))
                .with_call_timeout(Duration::from_secs(2)),
        )
        .virtual_network(net.clone())
        .broker(false)
        .connect_delay(Duration::ZERO)
}

/// A -> B <- C, with B serving and C offering the echo service.
async fn chain() -> (Node, Node, Node) {
    let net = VirtualNetwork::new();
    let a = node(test_identity("aaa"), &net).build().unwrap();
    let b = node(test_host_identity("bbb"), &net)
        .listen_on(virtual_contact("b"))
        .build()
        .unwrap();
    let c = node(test_host_identity("ccc"), &net)
        .service(Arc::new(Echo), ServiceProperties::new())
        .build()
        .unwrap();
    b.start().await.unwrap();

    a.communication().add_runtime_peer("virtual:b:1").await.unwrap();
    c.communication().add_runtime_peer("virtual:b:1").await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let network = b.network().clone();
            async move { network.connected_nodes().len() == 2 }
        })
        .await
    );
    (a, b, c)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_discovery_across_hops() {
    let (a, b, c) = chain().await;

    let nodes = a.communication().get_available_nodes(true).await;
    let ids: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
    assert_eq!(ids, vec![id("aaa"), id("bbb"), id("ccc")]);

    let state = a.communication().get_current_network_state().await;
    assert!(state.node(&id("aaa")).unwrap().is_local_node);
    assert_eq!(state.node(&id("ccc")).unwrap().display_name, "CCC");
    assert_eq!(a.routing().topology().shortest_path(&id("aaa"), &id("ccc")).unwrap().len(), 3);

    for n in [&a, &b, &c] {
        n.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_service_over_two_hops() {
    let (a, b, c) = chain().await;
    a.communication().get_available_nodes(true).await;

    let echo = a
        .communication()
        .get_service("echo", &ServiceProperties::new(), Some(&id("ccc")))
        .unwrap();
    assert_eq!(echo.invoke("say", b"hi").await.unwrap(), b"say:hi".to_vec());

    let missing = a
        .communication()
        .get_service("nope", &ServiceProperties::new(), Some(&id("ccc")))
        .unwrap();
    assert!(matches!(
        missing.invoke("say", b"hi").await,
        Err(OpsError::ServiceNotAvailable(_))
    ));

    let local = c.communication().get_service("echo", &ServiceProperties::new(), None).unwrap();
    assert_eq!(local.invoke("m", b"").await.unwrap(), b"m:".to_vec());
    assert!(matches!(
        a.communication().get_service("echo", &ServiceProperties::new(), None),
        Err(OpsError::ServiceNotAvailable(_))
    ));

    let rtt = a.communication().probe(&id("ccc"), Duration::from_secs(2)).await.unwrap();
    assert!(rtt < Duration::from_secs(2));

    for n in [&a, &b, &c] {
        n.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_node_has_no_route() {
    let (a, b, c) = chain().await;

    match a.communication().probe(&id("zzz"), Duration::from_secs(1)).await {
        Err(OpsError::Remote { code, message }) => {
            assert_eq!(code, ResultCode::ExceptionWhileForwarding);
            assert!(message.contains("Found no route towards 'zzz'"));
        }
        other => panic!("unexpected probe result {:?}", other),
    }

    for n in [&a, &b, &c] {
        n.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_topology_change_invalidates_cache() {
    let (a, b, c) = chain().await;
    let communication = a.communication().clone();

    assert_eq!(communication.get_available_nodes(true).await.len(), 3);
    let generation = communication.cache().generation();

    let mut changes = communication.subscribe_topology();
    let to_b = a.network().connection_to(&id("bbb")).unwrap();
    a.network().close_connection(to_b.id()).await.unwrap();

    let change = tokio::time::timeout(Duration::from_secs(2), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(change.cause, TopologyChangeCause::ConnectionLost(_)));
    assert!(
        wait_until(Duration::from_secs(2), || {
            let cache = communication.cache().clone();
            async move { cache.generation() > generation }
        })
        .await
    );

    let after = communication.get_available_nodes(false).await;
    assert_eq!(after.iter().map(|n| n.id.clone()).collect::<Vec<_>>(), vec![id("aaa")]);

    for n in [&a, &b, &c] {
        n.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reads_share_one_discovery() {
    let (a, b, c) = chain().await;
    let communication = a.communication().clone();
    let routing = communication.routing().clone();

    assert!(
        wait_until(Duration::from_secs(2), || {
            let routing = routing.clone();
            let cache = communication.cache().clone();
            async move {
                routing.topology().neighbors(&id("aaa")) == vec![id("bbb")]
                    && cache.generation() == routing.generation()
            }
        })
        .await
    );
    let before = communication.cache().recomputations();
    let generation = communication.cache().generation();

    let readers: Vec<_> = (0..10)
        .map(|_| {
            let communication = communication.clone();
            tokio::spawn(async move { communication.get_available_nodes(false).await })
        })
        .collect();
    for reader in futures::future::join_all(readers).await {
        assert_eq!(reader.unwrap().len(), 3);
    }

    assert_eq!(communication.cache().recomputations(), before + 1);
    assert_eq!(communication.cache().generation(), generation);
    assert!(routing.topology().contains(&id("ccc")));

    for n in [&a, &b, &c] {
        n.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_static_contact_map_routing() {
    let net = VirtualNetwork::new();
    let a = node(test_identity("aaa"), &net)
        .routing_config(RoutingConfig::default().with_strategy(RoutingStrategy::StaticContactMap))
        .listen_on(virtual_contact("a"))
        .contact_mapping(CommunicationType::ServiceCall, "b:1=b:virtual:1")
        .build()
        .unwrap();
    let b = node(
        test_host_identity("bbb").with_legacy_id(LegacyNodeId::new("b", 1)),
        &net,
    )
    .listen_on(virtual_contact("b"))
    .static_contact(virtual_contact("a"))
    .service(Arc::new(Echo), ServiceProperties::new())
    .build()
    .unwrap();
    a.start().await.unwrap();
    b.start().await.unwrap();

    // A only holds the connection B opened, so it has to use the map.
    let reached = b.connect_static_contacts().await;
    assert_eq!(reached.len(), 1);
    assert!(a.network().outgoing_connections().is_empty());

    let echo = a
        .communication()
        .get_service("echo", &ServiceProperties::new(), Some(&id("bbb")))
        .unwrap();
    assert_eq!(echo.invoke("x", b"1").await.unwrap(), b"x:1".to_vec());
    assert_eq!(a.network().outgoing_connections().len(), 1);

    // The connection is reused.
    echo.invoke("y", b"2").await.unwrap();
    assert_eq!(a.network().outgoing_connections().len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

struct CountingChecker(AtomicUsize);

impl ReachabilityChecker for CountingChecker {
    fn check_for_reachability(&self, node: &NodeIdentity) {
        assert_eq!(node.id, NodeId::new("aaa").unwrap());
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_check_reachability() {
    let net = VirtualNetwork::new();
    let a = node(test_identity("aaa"), &net).build().unwrap();
    let checker = CountingChecker(AtomicUsize::new(0));
    a.communication().check_reachability(&checker);
    assert_eq!(checker.0.load(Ordering::SeqCst), 1);
    assert!(a.communication().is_local(&id("aaa")));
    assert!(a.communication().add_runtime_peer("not a contact").await.is_err());
}
