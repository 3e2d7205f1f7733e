//! Registration and heartbeat loop.
//!
//! Resolves the node's public endpoint, publishes it to the signaling
//! server, and refreshes it every heartbeat so the server-side record never
//! ages past its TTL. A changed public endpoint is published on a watch
//! channel and re-registered on the same heartbeat.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};

use fungi_core::backoff::Backoff;

use crate::resolver::{EndpointResolver, ResolutionError};
use crate::signaling::SignalingApi;
use crate::socket::NodeSocket;

/// Upper bound on the best-effort deregistration at shutdown.
const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Init,
    Resolving,
    Registered,
    ReResolving,
}

#[derive(Debug, Clone)]
pub struct RegistrationTiming {
    /// Heartbeat interval H. Always below `ttl`.
    pub heartbeat: Duration,
    /// Server-side record TTL, used to tell when our record has lapsed.
    pub ttl: Duration,
    /// First delay between failed Register calls; doubles per failure.
    pub retry_base: Duration,
}

pub struct Registration {
    node_id: String,
    socket: NodeSocket,
    resolver: Arc<dyn EndpointResolver>,
    signaling: Arc<dyn SignalingApi>,
    timing: RegistrationTiming,
    endpoint_tx: watch::Sender<Option<SocketAddr>>,
    state_tx: watch::Sender<RegistrationState>,
    /// Start of the current run of failed Register calls.
    failing_since: Option<Instant>,
    lapse_reported: bool,
}

impl Registration {
    pub fn new(
        node_id: String,
        socket: NodeSocket,
        resolver: Arc<dyn EndpointResolver>,
        signaling: Arc<dyn SignalingApi>,
        timing: RegistrationTiming,
    ) -> Self {
        let (endpoint_tx, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(RegistrationState::Init);
        Self {
            node_id,
            socket,
            resolver,
            signaling,
            timing,
            endpoint_tx,
            state_tx,
            failing_since: None,
            lapse_reported: false,
        }
    }

    /// Current public endpoint; `None` until the first resolution succeeds.
    pub fn subscribe_endpoint(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.endpoint_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RegistrationState> {
        self.state_tx.subscribe()
    }

    /// `INIT → RESOLVING`. Resolver exhaustion here is fatal to the node.
    pub async fn resolve_initial(&self) -> Result<SocketAddr, ResolutionError> {
        self.state_tx.send_replace(RegistrationState::Resolving);
        let endpoint = self.resolver.resolve(&self.socket).await?;
        tracing::info!(
            node_id = %self.node_id,
            local = %self.socket.local_addr(),
            public = %endpoint,
            "public endpoint resolved"
        );
        self.endpoint_tx.send_replace(Some(endpoint));
        Ok(endpoint)
    }

    /// Register, then heartbeat until shutdown. Deregisters on the way out.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.timing.heartbeat);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The first tick completes immediately and doubles as the initial
        // Register. Failure is not fatal; the next heartbeat retries.
        let mut first = true;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {}
            }

            let round = async {
                if !first {
                    self.re_resolve().await;
                }
                self.register_until(Instant::now() + self.timing.heartbeat).await;
            };
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = round => {}
            }
            first = false;
            self.state_tx.send_replace(RegistrationState::Registered);
        }

        self.deregister().await;
    }

    /// `REGISTERED → RE_RESOLVING`. Failures keep the previous endpoint.
    async fn re_resolve(&self) {
        self.state_tx.send_replace(RegistrationState::ReResolving);

        // Leave at least half the heartbeat for Register.
        let budget = self.timing.heartbeat / 2;
        let resolved = tokio::time::timeout(budget, self.resolver.resolve(&self.socket)).await;

        let current = *self.endpoint_tx.borrow();
        match resolved {
            Ok(Ok(endpoint)) if Some(endpoint) != current => {
                tracing::info!(
                    node_id = %self.node_id,
                    old = ?current,
                    new = %endpoint,
                    "public endpoint changed"
                );
                self.endpoint_tx.send_replace(Some(endpoint));
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "re-resolve failed, keeping previous endpoint");
            }
            Err(_) => {
                tracing::warn!(budget_ms = budget.as_millis() as u64, "re-resolve timed out, keeping previous endpoint");
            }
        }
    }

    /// Call Register with backoff until it succeeds or the next retry would
    /// land past `deadline`.
    async fn register_until(&mut self, deadline: Instant) {
        let Some(endpoint) = *self.endpoint_tx.borrow() else {
            return;
        };
        let mut backoff = Backoff::new(self.timing.retry_base, self.timing.heartbeat);

        loop {
            let attempt = backoff.attempts() + 1;
            match self.signaling.register(&self.node_id, endpoint).await {
                Ok(()) => {
                    if let Some(since) = self.failing_since.take() {
                        tracing::info!(
                            node_id = %self.node_id,
                            down_secs = since.elapsed().as_secs(),
                            "registration restored"
                        );
                    }
                    self.lapse_reported = false;
                    tracing::debug!(node_id = %self.node_id, endpoint = %endpoint, "registered");
                    return;
                }
                Err(e) => {
                    let since = *self.failing_since.get_or_insert_with(Instant::now);
                    tracing::warn!(attempt, error = %e, "register failed");

                    if !self.lapse_reported && since.elapsed() >= self.timing.ttl {
                        tracing::warn!(
                            node_id = %self.node_id,
                            failing_secs = since.elapsed().as_secs(),
                            "registration failing for longer than the ttl; server entry has likely expired"
                        );
                        self.lapse_reported = true;
                    }
                    if !e.is_transient() {
                        return;
                    }
                }
            }

            let delay = backoff.next_delay();
            if Instant::now() + delay >= deadline {
                return;
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn deregister(&self) {
        match tokio::time::timeout(DEREGISTER_TIMEOUT, self.signaling.deregister(&self.node_id)).await {
            Ok(Ok(removed)) => tracing::info!(node_id = %self.node_id, removed, "deregistered"),
            Ok(Err(e)) => tracing::warn!(error = %e, "deregister failed"),
            Err(_) => tracing::warn!("deregister timed out"),
        }
    }
}
