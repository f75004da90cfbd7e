//! On-disk engine storage: the key-value implementation over flat
//! file-per-key buckets.

use std::path::Path;

use super::error::Result;
use super::kv::{FsBucket, KvStorage};

/// On-disk engine storage backend.
///
/// Keeps each logical table in its own subdirectory of `dir`, one file
/// per key. Suited to single-node deployments without a database server.
pub type DiskStorage = KvStorage<FsBucket>;

impl DiskStorage {
    /// Opens (creating if needed) storage rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self::with_buckets(
            FsBucket::open(dir.join("steps")).await?,
            FsBucket::open(dir.join("commands")).await?,
            FsBucket::open(dir.join("events")).await?,
            FsBucket::open(dir.join("status")).await?,
        ))
    }
}
