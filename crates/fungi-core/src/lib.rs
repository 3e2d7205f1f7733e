//! fungi-core: shared types, configuration, and the probe wire format.
//! All other Fungi crates depend on this one.

pub mod api;
pub mod backoff;
pub mod config;
pub mod record;
pub mod wire;

pub use api::{DeregisterResponse, PeerInfo, RegisterRequest, RegisterResponse, StatusResponse};
pub use record::{validate_registration, PeerEndpoint, ValidationError};
