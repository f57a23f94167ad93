//! Shared tier: cross-process cache on a shared KV store
//!
//! This module provides:
//! - The [`SharedStore`] byte-level trait implemented by Redis and by an
//!   in-memory store used in tests and when the tier is disabled
//! - [`SharedTier`], the typed wrapper applying the entry codec, key
//!   prefixing, and TTL handling

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use crate::cache::codec::{decode_entry, encode_entry, CodecConfig};
use crate::cache::entry::{CacheEntry, CacheTierLevel};
use crate::cache::CacheResult;

/// Shared tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedTierConfig {
    pub enabled: bool,
    /// Approximate byte budget used by utilization sweeps
    pub max_bytes: usize,
    pub default_ttl_seconds: u64,
    /// Compress payloads above the codec threshold
    pub compression: bool,
    pub key_prefix: String,
}

impl Default for SharedTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 512 * 1024 * 1024,
            default_ttl_seconds: 86_400,
            compression: true,
            key_prefix: "cache".to_string(),
        }
    }
}

/// Byte-level operations against the shared KV store
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Load raw bytes for a key
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store raw bytes with an optional TTL
    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()>;

    /// Delete a key, reporting whether it existed
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// A bounded sample of keys under a prefix
    async fn sample_keys(&self, prefix: &str, limit: usize) -> CacheResult<Vec<String>>;

    /// Delete every key under a prefix
    async fn clear_prefix(&self, prefix: &str) -> CacheResult<()>;
}

/// Redis-backed shared store
pub struct RedisSharedStore {
    redis: ConnectionManager,
}

impl RedisSharedStore {
    /// Connect to a Redis instance
    pub async fn connect(redis_url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }
}

#[async_trait]
impl SharedStore for RedisSharedStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let bytes: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(bytes)
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(bytes);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<_, ()>(&mut self.redis.clone()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(removed > 0)
    }

    async fn sample_keys(&self, prefix: &str, limit: usize) -> CacheResult<Vec<String>> {
        // One bounded SCAN page; the caller treats the result as a sample,
        // not an exhaustive listing.
        let (_, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(0)
            .arg("MATCH")
            .arg(format!("{}*", prefix))
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(keys.into_iter().take(limit).collect())
    }

    async fn clear_prefix(&self, prefix: &str) -> CacheResult<()> {
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}*", prefix))
            .query_async(&mut self.redis.clone())
            .await?;

        for key in keys {
            redis::cmd("DEL")
                .arg(&key)
                .query_async::<_, ()>(&mut self.redis.clone())
                .await?;
        }
        Ok(())
    }
}

/// In-memory shared store for tests and single-process deployments
pub struct InMemorySharedStore {
    data: DashMap<String, (Vec<u8>, Option<Instant>)>,
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }
}

impl Default for InMemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        match self.data.get(key) {
            Some(entry) => {
                let (bytes, expiry) = entry.value();
                if expiry.map_or(false, |at| Instant::now() >= at) {
                    drop(entry);
                    self.data.remove(key);
                    return Ok(None);
                }
                Ok(Some(bytes.clone()))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        let expiry = ttl.map(|t| Instant::now() + t);
        self.data.insert(key.to_string(), (bytes, expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.data.remove(key).is_some())
    }

    async fn sample_keys(&self, prefix: &str, limit: usize) -> CacheResult<Vec<String>> {
        Ok(self
            .data
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .take(limit)
            .map(|e| e.key().clone())
            .collect())
    }

    async fn clear_prefix(&self, prefix: &str) -> CacheResult<()> {
        self.data.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

/// Typed shared tier applying codec, prefixing, and TTLs
pub struct SharedTier {
    store: std::sync::Arc<dyn SharedStore>,
    codec: CodecConfig,
    key_prefix: String,
    default_ttl: Duration,
}

impl SharedTier {
    /// Wrap a byte store with the tier's codec and key scheme
    pub fn new(store: std::sync::Arc<dyn SharedStore>, config: &SharedTierConfig) -> Self {
        let codec = if config.compression {
            CodecConfig::default()
        } else {
            CodecConfig::uncompressed()
        };

        Self {
            store,
            codec,
            key_prefix: config.key_prefix.clone(),
            default_ttl: Duration::from_secs(config.default_ttl_seconds),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}/{}", self.key_prefix, key)
    }

    /// Load an entry; corrupted payloads are logged and reported as misses
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
                entry.tier = CacheTierLevel::Shared;
                entry.compressed = compressed;
                Ok(Some(entry))
            }
            Err(e) => {
                log::warn!("corrupted shared cache entry {}: {}", key, e);
                let _ = self.store.delete(&self.storage_key(key)).await;
                Ok(None)
            }
        }
    }

    /// Store an entry with its remaining TTL
    pub async fn put_entry(&self, mut entry: CacheEntry) -> CacheResult<()> {
        entry.tier = CacheTierLevel::Shared;

        let ttl = entry
            .remaining_ttl(Utc::now())
            .min(self.default_ttl.max(Duration::from_secs(1)));
        if ttl.is_zero() {
            return Ok(());
        }

        let key = self.storage_key(&entry.key);
        let bytes = encode_entry(&entry, &self.codec)?;
        self.store.put(&key, bytes, Some(ttl)).await
    }

    /// Delete an entry
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.store.delete(&self.storage_key(key)).await
    }

    /// Drop every entry under this tier's prefix
    pub async fn clear(&self) -> CacheResult<()> {
        self.store.clear_prefix(&format!("{}/", self.key_prefix)).await
    }

    /// Decode a bounded sample of resident entries
    pub async fn sample_entries(&self, limit: usize) -> CacheResult<Vec<CacheEntry>> {
        let prefix = format!("{}/", self.key_prefix);
        let keys = self.store.sample_keys(&prefix, limit).await?;

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            match decode_entry(&bytes) {
                Ok((mut entry, compressed)) => {
                    if entry.is_expired(Utc::now()) {
                        continue;
                    }
                    entry.tier = CacheTierLevel::Shared;
                    entry.compressed = compressed;
                    entries.push(entry);
                }
                Err(e) => {
                    log::warn!("corrupted shared cache entry {}: {}", key, e);
                    let _ = self.store.delete(&key).await;
                }
            }
        }

        Ok(entries)
    }
}

/// Persisted-state helpers shared with metrics and registry persistence
pub mod keys {
    /// Registry declaration key for a backend
    pub fn backend_registry(backend_id: &str) -> String {
        format!("backends:registry/{}", backend_id)
    }

    /// Hourly metrics bucket key
    pub fn backend_metrics(backend_id: &str, bucket_epoch: i64) -> String {
        format!("backends:metrics/{}/{}", backend_id, bucket_epoch)
    }

    /// Terminal job summary key
    pub fn job(job_id: &str) -> String {
        format!("jobs/{}", job_id)
    }

    /// Routing decision log key
    pub fn routing_decision(epoch_ms: i64) -> String {
        format!("routing:decisions/{}", epoch_ms)
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

    #[tokio::test]
    async fn test_round_trip_through_tier() {
        let tier = SharedTier::new(
            Arc::new(InMemorySharedStore::new()),
            &SharedTierConfig::default(),
        );

        tier.put_entry(entry("fp-1", 600)).await.unwrap();
        let loaded = tier.get_entry("fp-1").await.unwrap().unwrap();

        assert_eq!(loaded.key, "fp-1");
        assert_eq!(loaded.tier, CacheTierLevel::Shared);
    }

    #[tokio::test]
    async fn test_expired_entries_are_misses() {
        let store = Arc::new(InMemorySharedStore::new());
        let tier = SharedTier::new(store.clone(), &SharedTierConfig::default());

        let mut e = entry("fp-old", 600);
        e.expires_at = Utc::now() - chrono::Duration::seconds(5);
        // Bypass put_entry's TTL guard to simulate a stale record.
        let bytes = encode_entry(&e, &CodecConfig::default()).unwrap();
        store.put("cache/fp-old", bytes, None).await.unwrap();

        assert!(tier.get_entry("fp-old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupted_entry_is_a_miss() {
        let store = Arc::new(InMemorySharedStore::new());
        let tier = SharedTier::new(store.clone(), &SharedTierConfig::default());

        store
            .put("cache/fp-bad", vec![0xde, 0xad, 0xbe, 0xef], None)
            .await
            .unwrap();

        assert!(tier.get_entry("fp-bad").await.unwrap().is_none());
        // The corrupt record is removed.
        assert!(store.get("cache/fp-bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sample_entries_bounded() {
        let tier = SharedTier::new(
            Arc::new(InMemorySharedStore::new()),
            &SharedTierConfig::default(),
        );

        for i in 0..20 {
            tier.put_entry(entry(&format!("fp-{}", i), 600)).await.unwrap();
        }

        let sample = tier.sample_entries(5).await.unwrap();
        assert_eq!(sample.len(), 5);
    }

    #[tokio::test]
    async fn test_in_memory_store_ttl() {
        let store = InMemorySharedStore::new();
        store
            .put("k", vec![1], Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[test]
    fn test_persisted_key_layout() {
        assert_eq!(keys::backend_registry("b1"), "backends:registry/b1");
        assert_eq!(keys::backend_metrics("b1", 3600), "backends:metrics/b1/3600");
        assert_eq!(keys::job("j1"), "jobs/j1");
        assert_eq!(keys::routing_decision(42), "routing:decisions/42");
    }
}
