//! fungid: Fungi node daemon.
//!
//! Publishes this node's public endpoint, connects directly to every other
//! registered node, and relays lines typed on stdin to all connected peers.

use std::collections::HashMap;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use fungi_core::config::FungiConfig;
use fungi_node::{ConnectionSnapshot, ConnectionState, Node};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load config
    if let Err(e) = FungiConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = FungiConfig::load().context("failed to load config")?;

    if config.node.node_id.is_empty() {
        config.node.node_id = hex::encode(rand::random::<[u8; 8]>());
        tracing::info!(node_id = %config.node.node_id, "generated node id");
    }

    let mut node = Node::from_config(&config)
        .await
        .context("failed to start node")?;

    // ── Connection watcher ───────────────────────────────────────────────────
    let watcher = {
        let mut connections = node.subscribe_connections();
        tokio::spawn(async move {
            let mut last: HashMap<String, ConnectionState> = HashMap::new();
            while connections.changed().await.is_ok() {
                let snapshot: ConnectionSnapshot = connections.borrow_and_update().clone();
                for (peer, info) in &snapshot {
                    if last.get(peer) != Some(&info.state) {
                        tracing::info!(
                            peer = %peer,
                            remote = %info.remote,
                            state = ?info.state,
                            retries = info.retry_count,
                            "connection state"
                        );
                    }
                }
                for peer in last.keys().filter(|p| !snapshot.contains_key(*p)) {
                    tracing::info!(peer = %peer, "connection dropped");
                }
                last = snapshot.into_iter().map(|(k, v)| (k, v.state)).collect();
            }
        })
    };

    // ── Inbound printer ──────────────────────────────────────────────────────
    let printer = node.take_inbound().map(|mut inbound| {
        tokio::spawn(async move {
            while let Some(data) = inbound.recv().await {
                println!("[{}] {}", data.peer_id, String::from_utf8_lossy(&data.payload));
            }
        })
    });

    // ── Stdin relay ──────────────────────────────────────────────────────────
    let relay = {
        let control = node.control();
        let mut connections = node.subscribe_connections();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let connected: Vec<String> = connections
                    .borrow_and_update()
                    .values()
                    .filter(|c| c.state == ConnectionState::Connected)
                    .map(|c| c.peer_id.clone())
                    .collect();
                if connected.is_empty() {
                    tracing::info!("no connected peers");
                }
                for peer in connected {
                    if let Err(e) = control.send(&peer, line.as_bytes().to_vec()).await {
                        tracing::warn!(peer = %peer, error = %e, "send failed");
                    }
                }
            }
        })
    };

    tracing::info!(
        node_id = %node.node_id(),
        public = ?node.public_endpoint(),
        "fungid running"
    );

    // ── Wait for exit ────────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");

    relay.abort();
    node.shutdown().await;
    watcher.abort();
    if let Some(printer) = printer {
        printer.abort();
    }

    Ok(())
}
