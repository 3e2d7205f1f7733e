//! fungi-registry: the signaling server's ephemeral peer registry.
//!
//! Records live in an injectable backing store and expire `ttl` after their
//! last refresh. Expired records are filtered out of every listing and
//! purged by a background sweep.

pub mod expiry;
pub mod registry;
pub mod store;

pub use expiry::expiry_loop;
pub use registry::{NodeRecord, PeerRegistry, RegistryError};
pub use store::{MemoryStore, RegistryStore, StoreError};
