//! Endpoint resolution: learning the public address a NAT maps our socket to.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;

use fungi_core::backoff::retry_with_backoff;
use fungi_core::config::StunConfig;

use crate::socket::NodeSocket;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolutionError {
    #[error("failed to look up stun server {server:?}: {reason}")]
    ServerLookup { server: String, reason: String },
    #[error("stun server {0:?} has no address in the socket's family")]
    NoMatchingFamily(String),
    #[error("stun query failed: {0}")]
    Query(String),
    #[error("stun query timed out")]
    Timeout,
    #[error("{0} is not a routable public endpoint; set node.advertise_ip")]
    Unroutable(SocketAddr),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<ResolutionError>,
    },
}

/// Resolve the public endpoint of `socket`. The same socket carries peer
/// traffic afterwards, so the NAT mapping found here is the one peers use.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self, socket: &NodeSocket) -> Result<SocketAddr, ResolutionError>;
}

// ── STUN ──────────────────────────────────────────────────────────────────────

pub struct StunResolver {
    server: String,
    max_attempts: u32,
    base_delay: Duration,
    query_timeout: Duration,
}

impl StunResolver {
    pub fn new(server: impl Into<String>, max_attempts: u32, base_delay: Duration, query_timeout: Duration) -> Self {
        Self {
            server: server.into(),
            max_attempts: max_attempts.max(1),
            base_delay,
            query_timeout,
        }
    }

    pub fn from_config(config: &StunConfig) -> Self {
        Self::new(
            config.server.clone(),
            config.max_attempts,
            config.base_delay(),
            config.query_timeout(),
        )
    }

    /// First address of the STUN server in the same family as `local`.
    async fn server_addr(&self, local: SocketAddr) -> Result<SocketAddr, ResolutionError> {
        let addrs = lookup_host(self.server.as_str())
            .await
            .map_err(|e| ResolutionError::ServerLookup {
                server: self.server.clone(),
                reason: e.to_string(),
            })?;

        addrs
            .into_iter()
            .find(|a| a.is_ipv4() == local.is_ipv4())
            .ok_or_else(|| ResolutionError::NoMatchingFamily(self.server.clone()))
    }

    async fn query_once(
        &self,
        socket: &NodeSocket,
        server: SocketAddr,
    ) -> Result<SocketAddr, ResolutionError> {
        let _gate = socket.lock_reads().await;

        let mut client = stunclient::StunClient::new(server);
        client.set_timeout(self.query_timeout);

        // The client enforces its own timeout; this one bounds the await even
        // if the server trickles garbage at us.
        let bound = self.query_timeout + Duration::from_millis(250);
        match tokio::time::timeout(bound, client.query_external_address_async(socket.udp())).await {
            Ok(Ok(addr)) => Ok(addr),
            Ok(Err(e)) => Err(ResolutionError::Query(e.to_string())),
            Err(_) => Err(ResolutionError::Timeout),
        }
    }
}

#[async_trait]
impl EndpointResolver for StunResolver {
    async fn resolve(&self, socket: &NodeSocket) -> Result<SocketAddr, ResolutionError> {
        let server = self.server_addr(socket.local_addr()).await?;

        let result = retry_with_backoff(
            |attempt| async move {
                let result = self.query_once(socket, server).await;
                if let Err(e) = &result {
                    tracing::debug!(attempt, server = %server, error = %e, "stun attempt failed");
                }
                result
            },
            self.max_attempts,
            self.base_delay,
        )
        .await;

        match result {
            Ok(public) => {
                tracing::debug!(local = %socket.local_addr(), public = %public, "resolved public endpoint");
                Ok(public)
            }
            Err(last) => Err(ResolutionError::Exhausted {
                attempts: self.max_attempts,
                last: Box::new(last),
            }),
        }
    }
}

// ── Local ─────────────────────────────────────────────────────────────────────

/// Reports the socket's own bound address, optionally with another IP.
/// For nodes that are directly reachable, such as on a LAN or loopback.
#[derive(Debug, Clone, Default)]
pub struct LocalResolver {
    advertise_ip: Option<IpAddr>,
}

impl LocalResolver {
    pub fn new(advertise_ip: Option<IpAddr>) -> Self {
        Self { advertise_ip }
    }
}

#[async_trait]
impl EndpointResolver for LocalResolver {
    async fn resolve(&self, socket: &NodeSocket) -> Result<SocketAddr, ResolutionError> {
        let local = socket.local_addr();
        let endpoint = SocketAddr::new(self.advertise_ip.unwrap_or(local.ip()), local.port());
        if endpoint.ip().is_unspecified() {
            return Err(ResolutionError::Unroutable(endpoint));
        }
        Ok(endpoint)
    }
}
