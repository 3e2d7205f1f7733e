//! End-to-end: real nodes finding each other through a real signaling server.

use std::time::Duration;

use fungi_node::{ConnectionState, Node, NodeHandle, RegistrationState};

use crate::{eventually, node_config, register, SignalServer, TTL_SECS};

async fn start_node(server: &SignalServer, node_id: &str) -> NodeHandle {
    Node::from_config(&node_config(server, node_id))
        .await
        .expect("node starts")
}

async fn wait_state(node: &NodeHandle, peer: &str, state: ConnectionState, timeout: Duration) {
    let what = format!("{} to see {} as {:?}", node.node_id(), peer, state);
    eventually(timeout, &what, move || async move {
        node.connection(peer).map(|c| c.state) == Some(state)
    })
    .await
    .unwrap();
}

async fn wait_gone(node: &NodeHandle, peer: &str, timeout: Duration) {
    let what = format!("{} to drop {}", node.node_id(), peer);
    eventually(timeout, &what, move || async move { node.connection(peer).is_none() })
        .await
        .unwrap();
}

#[tokio::test]
async fn two_nodes_connect() {
    let server = SignalServer::start().await;
    let a = start_node(&server, "A").await;
    let b = start_node(&server, "B").await;

    // The local resolver publishes the bound socket itself.
    assert_eq!(a.public_endpoint(), Some(a.local_addr()));

    wait_state(&a, "B", ConnectionState::Connected, Duration::from_secs(10)).await;
    wait_state(&b, "A", ConnectionState::Connected, Duration::from_secs(10)).await;

    let seen_by_a = a.connection("B").unwrap();
    assert_eq!(seen_by_a.remote, b.local_addr());
    assert!(seen_by_a.retry_count <= 5);
    assert_eq!(a.registration_state(), RegistrationState::Registered);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn payloads_cross_the_direct_link() {
    let server = SignalServer::start().await;
    let mut a = start_node(&server, "A").await;
    let b = start_node(&server, "B").await;
    let mut inbound = a.take_inbound().unwrap();

    wait_state(&a, "B", ConnectionState::Connected, Duration::from_secs(10)).await;
    wait_state(&b, "A", ConnectionState::Connected, Duration::from_secs(10)).await;

    b.send("A", b"hello from B".to_vec()).await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(3), inbound.recv())
        .await
        .expect("payload arrives")
        .unwrap();
    assert_eq!(got.peer_id, "B");
    assert_eq!(got.payload, b"hello from B");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn dead_peer_is_isolated_then_dropped() {
    let server = SignalServer::start().await;

    // A "node" that registered once and went dark: nothing answers there.
    // Its record is kept fresh until A has given up on it.
    let dark = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let dark_addr = dark.local_addr().unwrap();
    server.register("ghost", dark_addr).await;
    let refresher = {
        let url = server.url.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                register(&url, "ghost", dark_addr).await;
            }
        })
    };

    let a = start_node(&server, "A").await;
    let b = start_node(&server, "B").await;

    // The ghost never blocks the real peer.
    wait_state(&a, "B", ConnectionState::Connected, Duration::from_secs(10)).await;
    wait_state(&a, "ghost", ConnectionState::Unreachable, Duration::from_secs(10)).await;
    assert_eq!(a.connection("ghost").unwrap().retry_count, 5);
    refresher.abort();

    // Once its record expires the ghost leaves the view and is dropped.
    wait_gone(&a, "ghost", Duration::from_secs(TTL_SECS + 3)).await;
    assert_eq!(a.connection("B").unwrap().state, ConnectionState::Connected);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn shutdown_deregisters_immediately() {
    let server = SignalServer::start().await;
    let a = start_node(&server, "A").await;
    let b = start_node(&server, "B").await;
    wait_state(&a, "B", ConnectionState::Connected, Duration::from_secs(10)).await;

    b.shutdown().await;
    assert!(server.list_peers("A").await.is_empty());

    // A drops the connection on its next poll, well before the TTL.
    wait_gone(&a, "B", Duration::from_secs(2)).await;

    a.shutdown().await;
}

#[tokio::test]
async fn late_joiner_is_discovered() {
    let server = SignalServer::start().await;
    let a = start_node(&server, "A").await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(a.connection("B").is_none());

    let b = start_node(&server, "B").await;
    wait_state(&a, "B", ConnectionState::Connected, Duration::from_secs(10)).await;
    wait_state(&b, "A", ConnectionState::Connected, Duration::from_secs(10)).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn explicit_close_is_idempotent() {
    let server = SignalServer::start().await;
    let a = start_node(&server, "A").await;
    let b = start_node(&server, "B").await;
    wait_state(&a, "B", ConnectionState::Connected, Duration::from_secs(10)).await;

    assert!(a.close("B").await.unwrap());
    assert!(!a.close("B").await.unwrap());
    assert_eq!(a.connection("B").unwrap().state, ConnectionState::Closed);

    a.shutdown().await;
    b.shutdown().await;
}
