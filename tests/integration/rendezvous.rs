//! Signaling server behaviour seen over HTTP.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::StatusCode;

use crate::{eventually, SignalServer, TTL_SECS};

#[tokio::test]
async fn registered_node_is_listed_for_others() {
    let server = SignalServer::start().await;
    assert_eq!(
        server.register("A", "1.2.3.4:51000".parse().unwrap()).await,
        StatusCode::OK
    );

    let peers = server.list_peers("B").await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].node_id, "A");
    assert_eq!(peers[0].ip, "1.2.3.4");
    assert_eq!(peers[0].port, 51000);
}

#[tokio::test]
async fn silent_node_drops_out_after_ttl() {
    let server = SignalServer::start().await;
    server.register("A", "1.2.3.4:51000".parse().unwrap()).await;
    assert_eq!(server.list_peers("B").await.len(), 1);

    tokio::time::sleep(Duration::from_secs(TTL_SECS) + Duration::from_millis(300)).await;
    assert!(server.list_peers("B").await.is_empty());
}

#[tokio::test]
async fn concurrent_registrations_are_all_kept() {
    let server = SignalServer::start().await;

    let mut tasks = Vec::new();
    for i in 0..32u16 {
        let url = server.url.clone();
        tasks.push(tokio::spawn(async move {
            reqwest::Client::new()
                .post(format!("{}/api/nodes", url))
                .json(&serde_json::json!({
                    "node_id": format!("node-{i}"),
                    "ip": "10.0.0.1",
                    "port": 20000 + i,
                }))
                .send()
                .await
                .unwrap()
                .status()
        }));
    }
    for t in tasks {
        assert_eq!(t.await.unwrap(), StatusCode::OK);
    }

    let peers: HashMap<String, u16> = server
        .list_peers("observer")
        .await
        .into_iter()
        .map(|p| (p.node_id, p.port))
        .collect();
    assert_eq!(peers.len(), 32);
    for i in 0..32u16 {
        assert_eq!(peers[&format!("node-{i}")], 20000 + i);
    }
}

#[tokio::test]
async fn re_register_moves_the_endpoint() {
    let server = SignalServer::start().await;
    server.register("A", "1.2.3.4:1000".parse().unwrap()).await;
    server.register("A", "5.6.7.8:2000".parse().unwrap()).await;

    let peers = server.list_peers("B").await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].ip, "5.6.7.8");
    assert_eq!(peers[0].port, 2000);
}

#[tokio::test]
async fn heartbeats_keep_a_node_listed() {
    let server = SignalServer::start().await;

    // Refresh at a third of the TTL for twice the TTL.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(TTL_SECS * 2);
    while tokio::time::Instant::now() < deadline {
        server.register("A", "1.2.3.4:1000".parse().unwrap()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(server.list_peers("B").await.len(), 1);

    // And the sweep purges it once refreshes stop.
    let registry = &server.registry;
    eventually(Duration::from_secs(TTL_SECS + 2), "record purged", move || async move {
        registry.sweep(std::time::Instant::now()).unwrap();
        registry.active_count(std::time::Instant::now()).unwrap() == 0
    })
    .await
    .unwrap();
}
