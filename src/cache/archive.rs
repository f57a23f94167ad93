//! Archive tier: object storage for large and cold entries
//!
//! The archive holds entries too large for the faster tiers and entries aged
//! out of them. Objects are immutable blobs keyed like the shared tier;
//! eviction here is TTL-only, driven by the maintenance sweep.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::cache::codec::{decode_entry, encode_entry, CodecConfig};
use crate::cache::entry::{CacheEntry, CacheTierLevel};
use crate::cache::CacheResult;

/// Archive tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveTierConfig {
    pub enabled: bool,
    /// Logical bucket name; maps onto a store namespace
    pub bucket: String,
    pub region: String,
    pub prefix: String,
    pub ttl_seconds: u64,
    /// Age in days after which shared entries may be archived
    pub archive_after_days: u32,
}

impl Default for ArchiveTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bucket: "finelens-archive".to_string(),
            region: "local".to_string(),
            prefix: "cache".to_string(),
            ttl_seconds: 7 * 86_400,
            archive_after_days: 2,
        }
    }
}

/// Object-level operations against the archive store
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Load an object
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store an object
    async fn put(&self, key: &str, bytes: Vec<u8>) -> CacheResult<()>;

    /// Delete an object, reporting whether it existed
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// A bounded listing of object keys under a prefix
    async fn list(&self, prefix: &str, limit: usize) -> CacheResult<Vec<String>>;
}

/// Embedded object store backed by sled
pub struct SledArchiveStore {
    tree: sled::Tree,
}

impl SledArchiveStore {
    /// Open (or create) the store at `path`, namespaced by bucket
    pub fn open(path: impl AsRef<Path>, bucket: &str) -> CacheResult<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(bucket)?;
        Ok(Self { tree })
    }

    /// An ephemeral store for tests
    pub fn temporary(bucket: &str) -> CacheResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree(bucket)?;
        Ok(Self { tree })
    }
}

#[async_trait]
impl ArchiveStore for SledArchiveStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> CacheResult<()> {
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.tree.remove(key)?.is_some())
    }

    async fn list(&self, prefix: &str, limit: usize) -> CacheResult<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.tree.scan_prefix(prefix).take(limit) {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(keys)
    }
}

/// In-memory archive store for tests
pub struct InMemoryArchiveStore {
    data: DashMap<String, Vec<u8>>,
}

impl InMemoryArchiveStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }
}

impl Default for InMemoryArchiveStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArchiveStore for InMemoryArchiveStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> CacheResult<()> {
        self.data.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.data.remove(key).is_some())
    }

    async fn list(&self, prefix: &str, limit: usize) -> CacheResult<Vec<String>> {
        Ok(self
            .data
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .take(limit)
            .map(|e| e.key().clone())
            .collect())
    }
}

/// Typed archive tier
pub struct ArchiveTier {
    store: std::sync::Arc<dyn ArchiveStore>,
    prefix: String,
    ttl: Duration,
}

impl ArchiveTier {
    /// Wrap an object store with this tier's key scheme and TTL
    pub fn new(store: std::sync::Arc<dyn ArchiveStore>, config: &ArchiveTierConfig) -> Self {
        Self {
            store,
            prefix: config.prefix.clone(),
            ttl: Duration::from_secs(config.ttl_seconds),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    /// Load an entry; corrupted or expired objects are misses
    pub async fn get_entry(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let Some(bytes) = self.store.get(&self.storage_key(key)).await? else {
            return Ok(None);
        };

        match decode_entry(&bytes) {
            Ok((mut entry, compressed)) => {
                if entry.is_expired(Utc::now()) {
                    let _ = self.store.delete(&self.storage_key(key)).await;
                    return Ok(None);
                }
                entry.tier = CacheTierLevel::Archive;
                entry.compressed = compressed;
                Ok(Some(entry))
            }
            Err(e) => {
                log::warn!("corrupted archive object {}: {}", key, e);
                let _ = self.store.delete(&self.storage_key(key)).await;
                Ok(None)
            }
        }
    }

    /// Store an entry, extending its expiry to the archive TTL floor
    pub async fn put_entry(&self, mut entry: CacheEntry) -> CacheResult<()> {
        entry.tier = CacheTierLevel::Archive;

        // Archived entries keep at least the archive TTL so a demotion does
        // not silently shorten their lifetime.
        let archive_expiry = Utc::now() + chrono::Duration::seconds(self.ttl.as_secs() as i64);
        if entry.expires_at < archive_expiry {
            entry.expires_at = archive_expiry;
        }

        let bytes = encode_entry(&entry, &CodecConfig::uncompressed())?;
        self.store.put(&self.storage_key(&entry.key), bytes).await
    }

    /// Delete an entry
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.store.delete(&self.storage_key(key)).await
    }

    /// Drop every object under this tier's prefix
    pub async fn clear(&self) -> CacheResult<()> {
        let prefix = format!("{}/", self.prefix);
        let keys = self.store.list(&prefix, usize::MAX).await?;
        for key in keys {
            let raw = key.strip_prefix(&prefix).unwrap_or(&key);
            let _ = self.store.delete(&self.storage_key(raw)).await;
        }
        Ok(())
    }

    /// Remove expired objects from a bounded sweep window
    pub async fn sweep_expired(&self, limit: usize) -> CacheResult<usize> {
        let prefix = format!("{}/", self.prefix);
        let keys = self.store.list(&prefix, limit).await?;
        let now = Utc::now();

        let mut removed = 0;
        for key in keys {
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            match decode_entry(&bytes) {
                Ok((entry, _)) if entry.is_expired(now) => {
                    if self.store.delete(&key).await? {
                        removed += 1;
                    }
                }
                Ok(_) => {}
                Err(_) => {
                    // Unreadable objects are reaped with the expired ones.
                    if self.store.delete(&key).await? {
                        removed += 1;
                    }
                }
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheValue;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn entry(key: &str, ttl: u64) -> CacheEntry {
        CacheEntry::new(
            key,
            "b1",
            HashSet::new(),
            CacheValue::from_artifact(serde_json::json!({"k": key})),
            ttl,
        )
    }

    fn tier() -> ArchiveTier {
        ArchiveTier::new(
            Arc::new(InMemoryArchiveStore::new()),
            &ArchiveTierConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_round_trip() {
        let tier = tier();
        tier.put_entry(entry("fp-1", 600)).await.unwrap();

        let loaded = tier.get_entry("fp-1").await.unwrap().unwrap();
        assert_eq!(loaded.key, "fp-1");
        assert_eq!(loaded.tier, CacheTierLevel::Archive);
    }

    #[tokio::test]
    async fn test_archive_extends_short_ttls() {
        let tier = tier();
        tier.put_entry(entry("fp-short", 10)).await.unwrap();

        let loaded = tier.get_entry("fp-short").await.unwrap().unwrap();
        assert!(loaded.remaining_ttl(Utc::now()) > Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let store = Arc::new(InMemoryArchiveStore::new());
        let tier = ArchiveTier::new(store.clone(), &ArchiveTierConfig::default());

        let mut stale = entry("fp-stale", 600);
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        let bytes = encode_entry(&stale, &CodecConfig::uncompressed()).unwrap();
        store.put("cache/fp-stale", bytes).await.unwrap();

        tier.put_entry(entry("fp-live", 600)).await.unwrap();

        let removed = tier.sweep_expired(100).await.unwrap();
        assert_eq!(removed, 1);
        assert!(tier.get_entry("fp-live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sled_store_round_trip() {
        let store = SledArchiveStore::temporary("finelens-test").unwrap();
        store.put("cache/k1", vec![1, 2, 3]).await.unwrap();

        assert_eq!(store.get("cache/k1").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.list("cache/", 10).await.unwrap().len(), 1);
        assert!(store.delete("cache/k1").await.unwrap());
        assert!(store.get("cache/k1").await.unwrap().is_none());
    }
}
