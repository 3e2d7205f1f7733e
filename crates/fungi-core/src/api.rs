//! JSON bodies exchanged with the signaling API.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::record::PeerEndpoint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub ip: String,
    pub port: u16,
}

impl RegisterRequest {
    pub fn new(node_id: &str, addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.to_string(),
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub node_id: String,
    pub ip: String,
    pub port: u16,
}

/// One active peer in a `ListPeers` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: String,
    pub ip: String,
    pub port: u16,
    /// Seconds since the peer last refreshed its registration.
    #[serde(default)]
    pub last_seen_secs: u64,
}

impl PeerInfo {
    /// Convert to a typed endpoint. None if the server sent a bad address.
    pub fn endpoint(&self) -> Option<PeerEndpoint> {
        let ip = self.ip.parse().ok()?;
        Some(PeerEndpoint::new(
            self.node_id.clone(),
            SocketAddr::new(ip, self.port),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregisterResponse {
    pub node_id: String,
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub active_nodes: usize,
    pub ttl_secs: u64,
    pub uptime_secs: u64,
}

/// Error body returned with every non-2xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub detail: String,
}
