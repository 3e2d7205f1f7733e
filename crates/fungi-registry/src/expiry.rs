//! Background sweep that purges expired registry records.

use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::PeerRegistry;

/// Remove registry entries that have not been refreshed within the TTL.
///
/// Listings already hide expired records; this only reclaims their memory.
/// Runs until the shutdown signal fires.
pub async fn expiry_loop(
    registry: PeerRegistry,
    check_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(check_interval);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("expiry loop shutting down");
                return;
            }

            _ = interval.tick() => {
                match registry.sweep(Instant::now()) {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "expired peer registry entries"),
                    Err(e) => tracing::warn!(error = %e, "registry sweep failed"),
                }
            }
        }
    }
}
