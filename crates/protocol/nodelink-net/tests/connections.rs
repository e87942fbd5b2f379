//! End-to-end connection tests over the virtual and broker transports.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nodelink_net::{
    InitiationRole, NetworkConnectionService, NetworkError, NetworkEvent, VirtualNetwork, VirtualTransportProvider,
};
use nodelink_test_utils::{
    broker_service, loopback_broker_contact, test_identity, test_network_config, test_request, virtual_contact,
    virtual_service, wait_until, RecordingRequestHandler,
};
use nodelink_types::{categories, NetworkContactPoint, NodeId, ResultCode};

const PING_TIMEOUT: Duration = Duration::from_millis(5000);

fn id(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

/// A connects to B, B records every `rpc` request it receives.
async fn ping_scenario(a: NetworkConnectionService, b: NetworkConnectionService, contact: NetworkContactPoint) {
    let recorder = RecordingRequestHandler::for_category(categories::RPC);
    b.add_request_handler(Arc::new(recorder.clone()));
    let contact = b.start_server(contact).await.unwrap();

    let connection = a.connect(&contact, true).await.unwrap();
    assert_eq!(connection.remote_id(), Some(&id("bbb")));
    assert_eq!(connection.role(), InitiationRole::SelfInitiated);

    assert!(
        wait_until(Duration::from_secs(2), || {
            let b = b.clone();
            async move { b.connection_to(&id("aaa")).is_some() }
        })
        .await
    );
    let back = b.connection_to(&id("aaa")).unwrap();
    assert_eq!(back.role(), InitiationRole::RemoteInitiated);
    assert_eq!(back.remote().unwrap().display_name, "AAA");

    let response = connection.request(test_request("ping"), PING_TIMEOUT).await;
    assert!(response.is_success(), "{:?}", response.error_message());
    assert_eq!(response.content(), b"ping");
    assert_eq!(recorder.senders(), vec![id("aaa")]);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ping_over_virtual_transport() {
    let net = VirtualNetwork::new();
    let a = virtual_service(test_identity("aaa"), &net);
    let b = virtual_service(test_identity("bbb"), &net);
    ping_scenario(a, b, virtual_contact("b")).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ping_over_broker_transport() {
    let a = broker_service(test_identity("aaa"));
    let b = broker_service(test_identity("bbb"));
    ping_scenario(a, b, loopback_broker_contact()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplex_requests_reach_initiator() {
    let a = broker_service(test_identity("aaa"));
    let b = broker_service(test_identity("bbb"));
    let recorder = RecordingRequestHandler::for_category(categories::RPC);
    a.add_request_handler(Arc::new(recorder.clone()));

    let contact = b.start_server(loopback_broker_contact()).await.unwrap();
    a.connect(&contact, true).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let b = b.clone();
            async move { b.connection_to(&id("aaa")).is_some() }
        })
        .await
    );

    let back = b.connection_to(&id("aaa")).unwrap();
    let response = back.request(test_request("from b"), PING_TIMEOUT).await;
    assert!(response.is_success(), "{:?}", response.error_message());
    assert_eq!(response.content(), b"from b");
    assert_eq!(recorder.senders(), vec![id("bbb")]);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_self_connection_is_protocol_violation() {
    let net = VirtualNetwork::new();
    let a = virtual_service(test_identity("aaa"), &net);
    let contact = a.start_server(virtual_contact("a")).await.unwrap();
    let result = a.connect(&contact, true).await;
    assert!(matches!(result, Err(NetworkError::ProtocolViolation(_))));

    let broker = broker_service(test_identity("aaa"));
    let contact = broker.start_server(loopback_broker_contact()).await.unwrap();
    let result = broker.connect(&contact, false).await;
    assert!(matches!(result, Err(NetworkError::ProtocolViolation(_))));
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_timeout() {
    // Accepts TCP connections but never answers.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let _silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let a = broker_service(test_identity("aaa"));
    let contact = NetworkContactPoint::new("broker", "127.0.0.1", port);
    let result = a.connect(&contact, true).await;
    match result {
        Err(e @ NetworkError::HandshakeTimeout(_)) => assert!(e.is_timeout()),
        other => panic!("expected handshake timeout, got {:?}", other.map(|c| c.id().clone())),
    }
}

#[tokio::test]
async fn test_connect_without_server_fails() {
    let a = broker_service(test_identity("aaa"));
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = a.connect(&NetworkContactPoint::new("broker", "127.0.0.1", port), true).await;
    assert!(matches!(result, Err(NetworkError::ConnectFailed(_))));

    let result = a.connect(&NetworkContactPoint::new("carrier-pigeon", "roof", 1), true).await;
    assert!(matches!(result, Err(NetworkError::UnknownTransport(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_server_keeps_connections() {
    let net = VirtualNetwork::new();
    let a = virtual_service(test_identity("aaa"), &net);
    let b = virtual_service(test_identity("bbb"), &net);
    let c = virtual_service(test_identity("ccc"), &net);
    b.add_request_handler(Arc::new(RecordingRequestHandler::new()));

    let contact = b.start_server(virtual_contact("b")).await.unwrap();
    let connection = a.connect(&contact, true).await.unwrap();
    b.stop_server(&contact).await.unwrap();
    assert!(b.server_contact_points().is_empty());

    assert!(matches!(
        c.connect(&contact, true).await,
        Err(NetworkError::HandshakeRejected(_))
    ));
    let response = connection.request(test_request("still there"), PING_TIMEOUT).await;
    assert!(response.is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stopped_broker_server_released_on_shutdown() {
    let a = broker_service(test_identity("aaa"));
    let b = broker_service(test_identity("bbb"));
    b.add_request_handler(Arc::new(RecordingRequestHandler::new()));

    let contact = b.start_server(loopback_broker_contact()).await.unwrap();
    let connection = a.connect(&contact, false).await.unwrap();
    b.stop_server(&contact).await.unwrap();
    let response = connection.request(test_request("after stop"), PING_TIMEOUT).await;
    assert!(response.is_success());

    // The stopped server still holds the link until the node shuts down.
    b.shutdown().await;
    assert!(
        wait_until(Duration::from_secs(2), || {
            let a = a.clone();
            async move { a.connections().is_empty() }
        })
        .await
    );
    assert!(matches!(a.connect(&contact, false).await, Err(NetworkError::ConnectFailed(_))));
    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simplex_transport_and_close_outgoing() {
    let net = VirtualNetwork::new();
    let a = NetworkConnectionService::new(test_identity("aaa"), test_network_config());
    a.register_transport_provider(Arc::new(VirtualTransportProvider::new(net.clone()).without_duplex()))
        .unwrap();
    let b = virtual_service(test_identity("bbb"), &net);
    b.add_request_handler(Arc::new(RecordingRequestHandler::new()));

    let contact = b.start_server(virtual_contact("b")).await.unwrap();
    assert_eq!(net.server_count(), 1);

    let connection = a.connect(&contact, true).await.unwrap();
    assert!(b.connection_to(&id("aaa")).is_none());
    let response = connection.request(test_request("one way"), PING_TIMEOUT).await;
    assert!(response.is_success());

    assert_eq!(a.outgoing_connections().len(), 1);
    a.close_all_outgoing_connections().await;
    assert!(a.outgoing_connections().is_empty());
    assert!(a.connections().is_empty());

    b.shutdown().await;
    assert_eq!(net.server_count(), 0);
    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_requests_are_paired() {
    let a = broker_service(test_identity("aaa"));
    let b = broker_service(test_identity("bbb"));
    let recorder = RecordingRequestHandler::new().with_delay(Duration::from_millis(20));
    b.add_request_handler(Arc::new(recorder.clone()));

    let contact = b.start_server(loopback_broker_contact()).await.unwrap();
    let connection = a.connect(&contact, false).await.unwrap();

    let requests = (0..50).map(|i| {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move {
            let marker = format!("marker-{}", i);
            let response = connection.request(test_request(&marker), PING_TIMEOUT).await;
            (marker, response)
        })
    });
    let results = futures::future::join_all(requests).await;

    for result in results {
        let (marker, response) = result.unwrap();
        assert!(response.is_success(), "{}: {:?}", marker, response.error_message());
        assert_eq!(response.content(), marker.as_bytes());
    }
    assert_eq!(recorder.call_count(), 50);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_timeout() {
    let net = VirtualNetwork::new();
    let a = virtual_service(test_identity("aaa"), &net);
    let b = virtual_service(test_identity("bbb"), &net);
    b.add_request_handler(Arc::new(RecordingRequestHandler::new().with_delay(Duration::from_millis(500))));

    let contact = b.start_server(virtual_contact("b")).await.unwrap();
    let connection = a.connect(&contact, false).await.unwrap();

    let response = connection.request(test_request("slow"), Duration::from_millis(50)).await;
    assert_eq!(response.result_code(), ResultCode::Timeout);
    assert_eq!(connection.pending_requests(), 0);
}

/// B answers after the requester gave up; the callback must see only the timeout.
async fn late_reply_scenario(a: NetworkConnectionService, b: NetworkConnectionService, contact: NetworkContactPoint) {
    let recorder = RecordingRequestHandler::new().with_delay(Duration::from_millis(300));
    b.add_request_handler(Arc::new(recorder.clone()));
    let contact = b.start_server(contact).await.unwrap();
    let connection = a.connect(&contact, false).await.unwrap();

    let codes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&codes);
    connection.send_request(test_request("late"), Duration::from_millis(50), move |response| {
        seen.lock().unwrap().push(response.result_code());
    });

    // Long enough for the reply to arrive after the timeout fired.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(recorder.call_count(), 1);
    assert_eq!(*codes.lock().unwrap(), vec![ResultCode::Timeout]);
    assert_eq!(connection.pending_requests(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_send_request_late_reply_over_virtual_transport() {
    let net = VirtualNetwork::new();
    let a = virtual_service(test_identity("aaa"), &net);
    let b = virtual_service(test_identity("bbb"), &net);
    late_reply_scenario(a, b, virtual_contact("b")).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_send_request_late_reply_over_broker_transport() {
    let a = broker_service(test_identity("aaa"));
    let b = broker_service(test_identity("bbb"));
    late_reply_scenario(a, b, loopback_broker_contact()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_initiator_shutdown_closes_remote_initiated_connection() {
    let a = broker_service(test_identity("aaa"));
    let b = broker_service(test_identity("bbb"));
    let mut events = b.subscribe();

    let contact = b.start_server(loopback_broker_contact()).await.unwrap();
    a.connect(&contact, true).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let b = b.clone();
            async move { b.connection_to(&id("aaa")).is_some() }
        })
        .await
    );

    a.shutdown().await;
    assert!(
        wait_until(Duration::from_secs(2), || {
            let b = b.clone();
            async move { b.connection_to(&id("aaa")).is_none() && b.connected_nodes().is_empty() }
        })
        .await
    );

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await.unwrap() {
                NetworkEvent::ConnectionClosed { remote, .. } => return remote,
                _ => continue,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(closed, Some(id("aaa")));

    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_events_published() {
    let net = VirtualNetwork::new();
    let a = virtual_service(test_identity("aaa"), &net);
    let b = virtual_service(test_identity("bbb"), &net);
    let mut events = a.subscribe();

    let contact = b.start_server(virtual_contact("b")).await.unwrap();
    let connection = a.connect(&contact, false).await.unwrap();
    a.close_connection(connection.id()).await.unwrap();

    match events.recv().await.unwrap() {
        NetworkEvent::ConnectionEstablished { remote, role, .. } => {
            assert_eq!(remote.id, id("bbb"));
            assert_eq!(role, InitiationRole::SelfInitiated);
        }
        other => panic!("unexpected event {:?}", other),
    }
    match events.recv().await.unwrap() {
        NetworkEvent::ConnectionClosed { remote, .. } => assert_eq!(remote, Some(id("bbb"))),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(a.connected_nodes().is_empty());
}
