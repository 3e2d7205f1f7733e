//! Direct peer connections over the node's shared UDP socket.
//!
//! One connection per discovered peer. Each runs its own hole-punching
//! attempt: `DISCOVERED → PROBING → CONNECTED | UNREACHABLE`, and any state
//! moves to `CLOSED` on removal or an explicit close.

pub mod manager;
mod peer;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use fungi_core::config::{NodeConfig, ProbeConfig};
use fungi_core::wire::MAX_PAYLOAD;

pub use manager::{ConnectionControl, ConnectionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Discovered,
    Probing,
    Connected,
    Unreachable,
    Closed,
}

impl ConnectionState {
    /// No further transitions happen without rediscovery.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Unreachable | ConnectionState::Closed)
    }
}

/// Observer's view of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_id: String,
    /// Published endpoint the connection targets.
    pub remote: SocketAddr,
    pub state: ConnectionState,
    /// Probe rounds sent so far.
    pub retry_count: u32,
    pub last_attempt: Option<Instant>,
}

pub type ConnectionSnapshot = HashMap<String, ConnectionInfo>;

/// Application payload received from a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundData {
    pub peer_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("no connection to {0}")]
    UnknownPeer(String),
    #[error("peer {0} is not connected")]
    NotConnected(String),
    #[error("payload of {0} bytes exceeds {MAX_PAYLOAD}")]
    PayloadTooLarge(usize),
    #[error("send queue for {0} is full")]
    Backpressure(String),
    #[error("connection manager stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ProbeTiming {
    /// Probe rounds before giving up.
    pub max_rounds: u32,
    /// Wait after the first round; doubles every round.
    pub base_delay: Duration,
    /// Keepalive cadence once connected.
    pub keepalive: Duration,
}

impl ProbeTiming {
    pub fn from_config(probe: &ProbeConfig, node: &NodeConfig) -> Self {
        Self {
            max_rounds: probe.max_rounds.max(1),
            base_delay: probe.base_delay(),
            keepalive: node.keepalive_interval(),
        }
    }
}
