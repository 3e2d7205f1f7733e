//! fungi-signal: rendezvous server holding the TTL-bound peer registry.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use fungi_core::config::FungiConfig;
use fungi_registry::{expiry_loop, PeerRegistry};

/// How long in-flight requests get to finish after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

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
    let config = FungiConfig::load().context("failed to load config")?;

    let listen_addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("invalid server.listen_addr {:?}", config.server.listen_addr))?;

    let registry = PeerRegistry::in_memory(config.registry.ttl());
    tracing::info!(
        ttl_secs = config.registry.ttl_secs,
        sweep_secs = config.registry.sweep_interval_secs,
        "peer registry ready"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let expiry_task = tokio::spawn(expiry_loop(
        registry.clone(),
        config.registry.sweep_interval(),
        shutdown_tx.subscribe(),
    ));

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;

    let mut api_task = {
        let state = fungi_api::ApiState::new(registry);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(fungi_api::serve_with_listener(listener, state, async move {
            let _ = shutdown_rx.recv().await;
        }))
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    let api_running = tokio::select! {
        _ = shutdown_rx.recv() => { tracing::info!("shutting down"); true }
        r = expiry_task        => { tracing::error!("expiry task exited: {:?}", r); true }
        r = &mut api_task      => {
            match r {
                Ok(Ok(())) => tracing::info!("signaling API stopped"),
                Ok(Err(e)) => return Err(e.context("signaling API failed")),
                Err(e)     => tracing::error!("signaling API task exited: {:?}", e),
            }
            false
        }
    };

    if api_running {
        let _ = shutdown_tx.send(());
        drain_api(api_task, DRAIN_TIMEOUT).await;
    }

    Ok(())
}

/// Wait for the API to finish in-flight requests, aborting it after `bound`.
/// Returns true when it stopped on its own.
async fn drain_api(mut api_task: JoinHandle<Result<()>>, bound: Duration) -> bool {
    match tokio::time::timeout(bound, &mut api_task).await {
        Ok(Ok(Ok(()))) => {
            tracing::info!("signaling API drained");
            true
        }
        Ok(Ok(Err(e))) => {
            tracing::warn!(error = %e, "signaling API failed while draining");
            true
        }
        Ok(Err(e)) => {
            tracing::error!("signaling API task exited: {:?}", e);
            true
        }
        Err(_) => {
            tracing::warn!(bound_secs = bound.as_secs(), "signaling API did not drain in time");
            api_task.abort();
            false
        }
    }
}
