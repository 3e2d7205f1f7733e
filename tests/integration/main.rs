//! Fungi integration test harness.
//!
//! Everything runs on loopback: a real signaling server on an ephemeral
//! port, real nodes bound to 127.0.0.1, and the local resolver standing in
//! for STUN unless a test brings its own STUN responder.
//!
//!   cargo test --test integration

mod connect;
mod rendezvous;
mod stun;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use fungi_api::ApiState;
use fungi_core::api::PeerInfo;
use fungi_core::config::FungiConfig;
use fungi_registry::{expiry_loop, PeerRegistry};

// ── Harness ───────────────────────────────────────────────────────────────────

/// Server-side TTL used by every test server.
pub const TTL_SECS: u64 = 3;

/// A signaling server running inside the test process.
pub struct SignalServer {
    pub url: String,
    pub registry: PeerRegistry,
    _shutdown: broadcast::Sender<()>,
}

impl SignalServer {
    pub async fn start() -> SignalServer {
        let registry = PeerRegistry::in_memory(Duration::from_secs(TTL_SECS));
        let (shutdown_tx, _) = broadcast::channel(1);

        tokio::spawn(expiry_loop(
            registry.clone(),
            Duration::from_millis(200),
            shutdown_tx.subscribe(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut stop = shutdown_tx.subscribe();
        tokio::spawn(fungi_api::serve_with_listener(
            listener,
            ApiState::new(registry.clone()),
            async move {
                let _ = stop.recv().await;
            },
        ));

        SignalServer {
            url: format!("http://{}", addr),
            registry,
            _shutdown: shutdown_tx,
        }
    }

    pub async fn register(&self, node_id: &str, endpoint: SocketAddr) -> reqwest::StatusCode {
        register(&self.url, node_id, endpoint).await
    }

    pub async fn list_peers(&self, caller_id: &str) -> Vec<PeerInfo> {
        reqwest::get(format!("{}/api/nodes?caller_id={}", self.url, caller_id))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

/// Raw Register call, bypassing any node machinery.
pub async fn register(url: &str, node_id: &str, endpoint: SocketAddr) -> reqwest::StatusCode {
    reqwest::Client::new()
        .post(format!("{}/api/nodes", url))
        .json(&serde_json::json!({
            "node_id": node_id,
            "ip": endpoint.ip().to_string(),
            "port": endpoint.port(),
        }))
        .send()
        .await
        .unwrap()
        .status()
}

/// Node config for a loopback node talking to `server`.
pub fn node_config(server: &SignalServer, node_id: &str) -> FungiConfig {
    let mut config = FungiConfig::default();
    config.registry.ttl_secs = TTL_SECS;
    config.node.node_id = node_id.to_string();
    config.node.bind_addr = "127.0.0.1:0".to_string();
    config.node.server_url = server.url.clone();
    config.node.heartbeat_interval_secs = 1;
    config.node.poll_interval_secs = 1;
    config.node.keepalive_interval_secs = 1;
    config.stun.server = String::new();
    config.probe.max_rounds = 5;
    config.probe.base_delay_ms = 100;
    config
}

/// Poll `check` every 50ms until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out after {:?} waiting for {}", timeout, what);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
