//! STUN resolution against a scripted responder on loopback.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use fungi_node::Node;

use crate::{node_config, SignalServer};

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_SUCCESS: u16 = 0x0101;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Answers every binding request with `mapped`, as a NAT would see it.
/// Returns the responder's address and a counter of requests served.
async fn fake_stun(mapped: SocketAddrV4) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if n < 20 {
                continue;
            }
            let mut reply = Vec::with_capacity(32);
            reply.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
            reply.extend_from_slice(&12u16.to_be_bytes());
            reply.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
            reply.extend_from_slice(&buf[8..20]);

            reply.extend_from_slice(&XOR_MAPPED_ADDRESS.to_be_bytes());
            reply.extend_from_slice(&8u16.to_be_bytes());
            reply.push(0x00);
            reply.push(0x01);
            reply.extend_from_slice(&(mapped.port() ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
            reply.extend_from_slice(&(u32::from(*mapped.ip()) ^ MAGIC_COOKIE).to_be_bytes());

            counter.fetch_add(1, Ordering::SeqCst);
            let _ = socket.send_to(&reply, from).await;
        }
    });

    (addr, served)
}

#[tokio::test]
async fn node_publishes_the_stun_mapped_endpoint() {
    let server = SignalServer::start().await;
    let mapped = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 5), 40000);
    let (stun_addr, served) = fake_stun(mapped).await;

    let mut config = node_config(&server, "A");
    config.stun.server = stun_addr.to_string();
    config.stun.query_timeout_ms = 1000;

    let node = Node::from_config(&config).await.expect("node starts");
    assert_eq!(node.public_endpoint(), Some(SocketAddr::V4(mapped)));
    assert!(served.load(Ordering::SeqCst) >= 1);

    let peers = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let peers = server.list_peers("observer").await;
            if !peers.is_empty() {
                return peers;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("node registers");
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].node_id, "A");
    assert_eq!(peers[0].ip, "203.0.113.5");
    assert_eq!(peers[0].port, 40000);

    node.shutdown().await;
}

#[tokio::test]
async fn silent_stun_server_fails_startup() {
    let server = SignalServer::start().await;
    // Bound but never read: queries go unanswered.
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

    let mut config = node_config(&server, "A");
    config.stun.server = silent.local_addr().unwrap().to_string();
    config.stun.max_attempts = 2;
    config.stun.base_delay_ms = 50;
    config.stun.query_timeout_ms = 200;

    let started = Node::from_config(&config).await;
    assert!(started.is_err());
    assert!(server.list_peers("observer").await.is_empty());
}
