//! fungi-node: everything a node runs to find peers and reach them directly.
//!
//! The endpoint resolver learns the node's NAT-mapped public address, the
//! registration loop keeps it published on the signaling server, the
//! discovery loop polls for other nodes, and the connection manager punches
//! a direct UDP path to each of them over the same socket.

pub mod connection;
pub mod discovery;
pub mod error;
pub mod node;
pub mod registration;
pub mod resolver;
pub mod signaling;
pub mod socket;

pub use connection::{
    ConnectionControl, ConnectionError, ConnectionInfo, ConnectionSnapshot, ConnectionState,
    InboundData, ProbeTiming,
};
pub use discovery::{DiscoveryEvent, PeerView};
pub use error::NodeError;
pub use node::{Node, NodeHandle};
pub use registration::RegistrationState;
pub use resolver::{EndpointResolver, LocalResolver, ResolutionError, StunResolver};
pub use signaling::{HttpSignalingClient, SignalingApi, SignalingError};
pub use socket::NodeSocket;
