//! Backing stores for the peer registry.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::registry::NodeRecord;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached. Callers may retry later.
    #[error("registry backend unavailable: {0}")]
    Unavailable(String),
}

/// Key-value backend behind `PeerRegistry`.
///
/// Implementations must make `upsert` atomic per key: concurrent writes for
/// different ids never interfere, and concurrent writes for the same id
/// leave exactly one of them visible.
pub trait RegistryStore: Send + Sync {
    /// Overwrite the endpoint for `node_id` and refresh `last_seen`.
    /// `last_seen` never moves backwards.
    fn upsert(&self, node_id: &str, ip: IpAddr, port: u16, now: Instant)
        -> Result<(), StoreError>;

    /// Delete a record. Returns whether it existed.
    fn remove(&self, node_id: &str) -> Result<bool, StoreError>;

    /// Every stored record, expired or not.
    fn snapshot(&self) -> Result<Vec<NodeRecord>, StoreError>;

    /// Drop every record for which `keep` is false. Returns how many went.
    fn retain(&self, keep: &dyn Fn(&NodeRecord) -> bool) -> Result<usize, StoreError>;
}

/// In-process store. DashMap shards give per-key write locking.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<DashMap<String, NodeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RegistryStore for MemoryStore {
    fn upsert(
        &self,
        node_id: &str,
        ip: IpAddr,
        port: u16,
        now: Instant,
    ) -> Result<(), StoreError> {
        self.records
            .entry(node_id.to_string())
            .and_modify(|record| {
                record.public_ip = ip;
                record.public_port = port;
                record.last_seen = record.last_seen.max(now);
            })
            .or_insert_with(|| NodeRecord {
                node_id: node_id.to_string(),
                public_ip: ip,
                public_port: port,
                last_seen: now,
            });
        Ok(())
    }

    fn remove(&self, node_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.remove(node_id).is_some())
    }

    fn snapshot(&self) -> Result<Vec<NodeRecord>, StoreError> {
        Ok(self.records.iter().map(|e| e.value().clone()).collect())
    }

    fn retain(&self, keep: &dyn Fn(&NodeRecord) -> bool) -> Result<usize, StoreError> {
        let before = self.records.len();
        self.records.retain(|_, record| keep(record));
        Ok(before.saturating_sub(self.records.len()))
    }
}
