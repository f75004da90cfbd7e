//! In-memory engine storage: the key-value implementation over map
//! buckets. State does not survive the process; intended for tests and
//! single-node deployments that can tolerate losing in-flight steps.

use super::kv::{KvStorage, MapBucket};

/// In-memory engine storage backend.
pub type InMemStorage = KvStorage<MapBucket>;

impl InMemStorage {
    pub fn new() -> Self {
        Self::with_buckets(
            MapBucket::new(),
            MapBucket::new(),
            MapBucket::new(),
            MapBucket::new(),
        )
    }
}

impl Default for InMemStorage {
    fn default() -> Self {
        Self::new()
    }
}
