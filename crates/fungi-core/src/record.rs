//! Node identity and endpoint validation, shared by server and node.

use std::net::{IpAddr, SocketAddr};

/// Longest node id accepted by the registry, in bytes.
pub const MAX_NODE_ID_LEN: usize = 128;

/// A peer as seen by a node: its id and published public endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerEndpoint {
    pub node_id: String,
    pub addr: SocketAddr,
}

impl PeerEndpoint {
    pub fn new(node_id: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            addr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("node_id must not be empty")]
    EmptyNodeId,
    #[error("node_id exceeds {MAX_NODE_ID_LEN} bytes")]
    NodeIdTooLong,
    #[error("node_id contains whitespace or control characters")]
    NodeIdCharacters,
    #[error("invalid ip address: {0:?}")]
    InvalidIp(String),
    #[error("ip address {0} is not routable")]
    UnroutableIp(IpAddr),
    #[error("port must be in 1..=65535")]
    InvalidPort,
}

/// Check a node id.
pub fn validate_node_id(node_id: &str) -> Result<(), ValidationError> {
    if node_id.is_empty() {
        return Err(ValidationError::EmptyNodeId);
    }
    if node_id.len() > MAX_NODE_ID_LEN {
        return Err(ValidationError::NodeIdTooLong);
    }
    if node_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::NodeIdCharacters);
    }
    Ok(())
}

/// Validate the raw fields of a `Register` call and parse the address.
pub fn validate_registration(
    node_id: &str,
    ip: &str,
    port: u16,
) -> Result<(IpAddr, u16), ValidationError> {
    validate_node_id(node_id)?;

    let ip: IpAddr = ip
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidIp(ip.to_string()))?;
    if ip.is_unspecified() || ip.is_multicast() {
        return Err(ValidationError::UnroutableIp(ip));
    }
    if port == 0 {
        return Err(ValidationError::InvalidPort);
    }
    Ok((ip, port))
}
