//! Peer registry: TTL-bounded map from node id to public endpoint.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fungi_core::record::{validate_node_id, validate_registration, ValidationError};

use crate::store::{MemoryStore, RegistryStore, StoreError};

/// A registered node's public endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub node_id: String,
    pub public_ip: IpAddr,
    pub public_port: u16,
    /// Last time the node refreshed its registration.
    pub last_seen: Instant,
}

impl NodeRecord {
    /// A record is active while `now - last_seen < ttl`.
    pub fn is_active(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) < ttl
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.public_ip, self.public_port)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("{0}")]
    Unavailable(String),
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => RegistryError::Unavailable(msg),
        }
    }
}

/// The registry handle. Cheap to clone, shared by every API request.
#[derive(Clone)]
pub struct PeerRegistry {
    store: Arc<dyn RegistryStore>,
    ttl: Duration,
}

impl PeerRegistry {
    pub fn new(store: Arc<dyn RegistryStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Registry over a fresh in-process store.
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryStore::new()), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or refresh a node's record, setting `last_seen = now`.
    pub fn upsert(
        &self,
        node_id: &str,
        ip: IpAddr,
        port: u16,
        now: Instant,
    ) -> Result<(), RegistryError> {
        validate_node_id(node_id)?;
        if port == 0 {
            return Err(ValidationError::InvalidPort.into());
        }
        self.store.upsert(node_id, ip, port, now)?;
        tracing::debug!(node_id, ip = %ip, port, "registry upsert");
        Ok(())
    }

    /// Validate raw `Register` fields, then upsert. Nothing is written when
    /// validation fails.
    pub fn register(
        &self,
        node_id: &str,
        ip: &str,
        port: u16,
        now: Instant,
    ) -> Result<SocketAddr, RegistryError> {
        let (ip, port) = validate_registration(node_id, ip, port)?;
        self.upsert(node_id, ip, port, now)?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Every active record except `exclude_node_id`'s.
    pub fn list_active(
        &self,
        exclude_node_id: &str,
        now: Instant,
    ) -> Result<Vec<NodeRecord>, RegistryError> {
        let ttl = self.ttl;
        Ok(self
            .store
            .snapshot()?
            .into_iter()
            .filter(|r| r.node_id != exclude_node_id && r.is_active(now, ttl))
            .collect())
    }

    /// Explicit deregistration. Returns whether the node was present.
    pub fn remove(&self, node_id: &str) -> Result<bool, RegistryError> {
        validate_node_id(node_id)?;
        let removed = self.store.remove(node_id)?;
        if removed {
            tracing::info!(node_id, "node deregistered");
        }
        Ok(removed)
    }

    /// Purge expired records. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> Result<usize, RegistryError> {
        let ttl = self.ttl;
        Ok(self.store.retain(&|r| r.is_active(now, ttl))?)
    }

    pub fn active_count(&self, now: Instant) -> Result<usize, RegistryError> {
        let ttl = self.ttl;
        Ok(self
            .store
            .snapshot()?
            .iter()
            .filter(|r| r.is_active(now, ttl))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const TTL: Duration = Duration::from_secs(30);

    fn ids(records: &[NodeRecord]) -> Vec<String> {
        let mut ids: Vec<String> = records.iter().map(|r| r.node_id.clone()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn registered_node_is_listed_for_others() {
        let registry = PeerRegistry::in_memory(TTL);
        let now = Instant::now();
        registry.register("A", "1.2.3.4", 51000, now).unwrap();

        let peers = registry.list_active("B", now).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].node_id, "A");
        assert_eq!(peers[0].endpoint(), "1.2.3.4:51000".parse().unwrap());
    }

    #[test]
    fn caller_is_excluded() {
        let registry = PeerRegistry::in_memory(TTL);
        let now = Instant::now();
        registry.register("A", "1.2.3.4", 51000, now).unwrap();
        registry.register("B", "1.2.3.5", 51000, now).unwrap();

        assert_eq!(ids(&registry.list_active("A", now).unwrap()), vec!["B"]);
    }

    #[test]
    fn silent_node_expires_after_ttl() {
        let registry = PeerRegistry::in_memory(TTL);
        let start = Instant::now();
        registry.register("A", "1.2.3.4", 51000, start).unwrap();

        let almost = start + TTL - Duration::from_millis(1);
        assert_eq!(registry.list_active("B", almost).unwrap().len(), 1);

        // Exactly TTL is already stale.
        assert!(registry.list_active("B", start + TTL).unwrap().is_empty());
        assert!(registry
            .list_active("B", start + Duration::from_secs(31))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn heartbeat_keeps_node_alive() {
        let registry = PeerRegistry::in_memory(TTL);
        let start = Instant::now();
        registry.register("A", "1.2.3.4", 51000, start).unwrap();
        registry
            .register("A", "1.2.3.4", 51000, start + Duration::from_secs(20))
            .unwrap();

        let later = start + Duration::from_secs(45);
        assert_eq!(registry.list_active("B", later).unwrap().len(), 1);
    }

    #[test]
    fn latest_endpoint_wins() {
        let registry = PeerRegistry::in_memory(TTL);
        let now = Instant::now();
        let writes = [
            ("A", "1.1.1.1", 1000),
            ("B", "2.2.2.2", 2000),
            ("A", "3.3.3.3", 3000),
            ("B", "2.2.2.2", 2001),
            ("A", "4.4.4.4", 4000),
        ];
        for (i, (id, ip, port)) in writes.iter().enumerate() {
            registry
                .register(id, ip, *port, now + Duration::from_millis(i as u64))
                .unwrap();
        }

        let peers: HashMap<String, SocketAddr> = registry
            .list_active("C", now + Duration::from_secs(1))
            .unwrap()
            .into_iter()
            .map(|r| (r.node_id.clone(), r.endpoint()))
            .collect();
        assert_eq!(peers["A"], "4.4.4.4:4000".parse().unwrap());
        assert_eq!(peers["B"], "2.2.2.2:2001".parse().unwrap());
    }

    #[test]
    fn register_is_idempotent() {
        let once = PeerRegistry::in_memory(TTL);
        let twice = PeerRegistry::in_memory(TTL);
        let now = Instant::now();

        once.register("A", "1.2.3.4", 51000, now).unwrap();
        twice.register("A", "1.2.3.4", 51000, now).unwrap();
        twice.register("A", "1.2.3.4", 51000, now).unwrap();

        let a: Vec<SocketAddr> = once.list_active("B", now).unwrap().iter().map(NodeRecord::endpoint).collect();
        let b: Vec<SocketAddr> = twice.list_active("B", now).unwrap().iter().map(NodeRecord::endpoint).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_input_leaves_registry_untouched() {
        let registry = PeerRegistry::in_memory(TTL);
        let now = Instant::now();
        assert!(matches!(
            registry.register("", "1.2.3.4", 1, now),
            Err(RegistryError::Invalid(ValidationError::EmptyNodeId))
        ));
        assert!(matches!(
            registry.register("A", "not-an-ip", 1, now),
            Err(RegistryError::Invalid(_))
        ));
        assert!(matches!(
            registry.upsert("A", "1.2.3.4".parse().unwrap(), 0, now),
            Err(RegistryError::Invalid(ValidationError::InvalidPort))
        ));
        assert_eq!(registry.active_count(now).unwrap(), 0);
    }

    #[test]
    fn sweep_purges_only_expired() {
        let registry = PeerRegistry::in_memory(TTL);
        let start = Instant::now();
        registry.register("old", "1.2.3.4", 1, start).unwrap();
        registry
            .register("new", "1.2.3.5", 1, start + Duration::from_secs(20))
            .unwrap();

        let purged = registry.sweep(start + Duration::from_secs(35)).unwrap();
        assert_eq!(purged, 1);
        assert_eq!(
            ids(&registry.list_active("x", start + Duration::from_secs(35)).unwrap()),
            vec!["new"]
        );
    }

    #[test]
    fn remove_then_list() {
        let registry = PeerRegistry::in_memory(TTL);
        let now = Instant::now();
        registry.register("A", "1.2.3.4", 1, now).unwrap();
        assert!(registry.remove("A").unwrap());
        assert!(!registry.remove("A").unwrap());
        assert!(registry.list_active("B", now).unwrap().is_empty());
    }

    #[test]
    fn concurrent_registrations_are_all_kept() {
        let registry = PeerRegistry::in_memory(TTL);
        let now = Instant::now();

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let id = format!("node-{i}");
                    registry.register(&id, "10.0.0.1", 1000 + i as u16, now).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let peers = registry.list_active("observer", now).unwrap();
        assert_eq!(peers.len(), 64);
        for r in peers {
            let i: u16 = r.node_id.trim_start_matches("node-").parse().unwrap();
            assert_eq!(r.public_port, 1000 + i);
        }
    }

    #[test]
    fn same_id_races_leave_one_write_visible() {
        let registry = PeerRegistry::in_memory(TTL);
        let now = Instant::now();

        let handles: Vec<_> = (1..=16u16)
            .map(|port| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.register("A", "10.0.0.1", port, now).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let peers = registry.list_active("B", now).unwrap();
        assert_eq!(peers.len(), 1);
        assert!((1..=16).contains(&peers[0].public_port));
    }

    struct DownStore;

    impl RegistryStore for DownStore {
        fn upsert(&self, _: &str, _: IpAddr, _: u16, _: Instant) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        fn remove(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        fn snapshot(&self) -> Result<Vec<NodeRecord>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        fn retain(&self, _: &dyn Fn(&NodeRecord) -> bool) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[test]
    fn backend_failure_surfaces_as_unavailable() {
        let registry = PeerRegistry::new(Arc::new(DownStore), TTL);
        let now = Instant::now();
        assert!(matches!(
            registry.register("A", "1.2.3.4", 1, now),
            Err(RegistryError::Unavailable(_))
        ));
        assert!(matches!(
            registry.list_active("A", now),
            Err(RegistryError::Unavailable(_))
        ));
    }
}
