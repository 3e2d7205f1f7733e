use std::net::SocketAddr;

use fungi_core::config::ConfigError;
use fungi_core::record::ValidationError;

use crate::resolver::ResolutionError;
use crate::signaling::SignalingError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid node id: {0}")]
    InvalidNodeId(#[from] ValidationError),
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error("invalid {field}: {value:?}")]
    Config { field: &'static str, value: String },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("public endpoint resolution failed: {0}")]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}
