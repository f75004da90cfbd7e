//! Key-value bucket abstraction and the bundled implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::storage::error::Result;

/// A flat bucket of binary values addressed by string keys.
///
/// The generic key-value engine storage is built from four of these.
/// Implementations must be safe for concurrent use; multi-key atomicity is
/// provided above the bucket by the storage's coarse lock.
#[async_trait]
pub trait KvBucket: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn has(&self, key: &str) -> Result<bool>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys currently in the bucket. Traversal is inherently racy
    /// against concurrent writers; callers tolerate keys appearing or
    /// vanishing mid-scan.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory bucket backed by a concurrent map.
#[derive(Default)]
pub struct MapBucket {
    entries: DashMap<String, Vec<u8>>,
}

impl MapBucket {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBucket for MapBucket {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

/// On-disk bucket: one flat file per key under a bucket directory.
///
/// Key strings are hex-encoded into filenames, so arbitrary enrollment
/// ids and uuids are safe to use as key components.
pub struct FsBucket {
    dir: PathBuf,
}

impl FsBucket {
    /// Opens (creating if needed) a bucket directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(key.as_bytes()))
    }
}

#[async_trait]
impl KvBucket for FsBucket {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        tokio::fs::write(self.path_for(key), value).await?;
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        match tokio::fs::metadata(self.path_for(key)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // skip anything that isn't one of our hex-encoded keys
            let Ok(decoded) = hex::decode(name) else {
                continue;
            };
            if let Ok(key) = String::from_utf8(decoded) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
