//! Multi-tier response cache with exact and semantic lookup
//!
//! This module provides:
//! - Three tiers: in-process memory (LRU, byte budget), shared KV store
//!   (compressed), and an object-store archive for large/cold entries
//! - Exact lookup by request fingerprint with capability checks
//! - Semantic lookup by cosine similarity over entry embeddings
//! - Promotion of hot entries toward memory and demotion under pressure
//! - Per-tier hit/miss/promotion/demotion/eviction counters
//!
//! Failure semantics: any tier may be disabled or unreachable; lookups
//! degrade silently to the remaining tiers and store failures fall back to
//! the next-lower tier. No cache error ever reaches a caller.

pub mod archive;
pub mod codec;
pub mod entry;
pub mod eviction;
pub mod memory;
pub mod semantic;
pub mod shared;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::{Capability, PrincipalTier};

pub use archive::{ArchiveStore, ArchiveTier, ArchiveTierConfig, InMemoryArchiveStore, SledArchiveStore};
pub use codec::{CodecConfig, Compression, EncodedData};
pub use entry::{CacheEntry, CacheTierLevel, CacheValue};
pub use eviction::{EvictionConfig, EvictionPolicy, EvictionStrategy};
pub use memory::{MemoryTier, MemoryTierConfig};
pub use semantic::{
    cosine_similarity, Embedder, HashProjectionEmbedder, SemanticQuery, SimilarityConfig,
};
pub use shared::{InMemorySharedStore, RedisSharedStore, SharedStore, SharedTier, SharedTierConfig};

/// Cache errors; internal only, logged and never surfaced to submitters
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Archive store error: {0}")]
    Archive(#[from] sled::Error),

    #[error("Corrupted cache entry: {0}")]
    Corrupt(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Entries above this size go straight to the archive tier
const ARCHIVE_SIZE_THRESHOLD: usize = 10 * 1024 * 1024;

/// Entries above this size skip the memory tier
const SHARED_SIZE_THRESHOLD: usize = 1024 * 1024;

/// Metadata key recording the similarity score of a semantic hit
pub const SIMILARITY_METADATA_KEY: &str = "similarity_score";

/// Cache configuration across tiers
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    pub memory: MemoryTierConfig,
    pub shared: SharedTierConfig,
    pub archive: ArchiveTierConfig,
    pub similarity: SimilarityConfig,
}

/// Counters for one tier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierCounters {
    pub hits: u64,
    pub stores: u64,
    pub promotions_in: u64,
    pub demotions_in: u64,
    pub evictions: u64,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory: TierCounters,
    pub shared: TierCounters,
    pub archive: TierCounters,
    pub semantic_hits: u64,
    pub misses: u64,
    pub memory_entries: usize,
    pub memory_bytes: usize,
}

#[derive(Default)]
struct TierCountersInner {
    hits: AtomicU64,
    stores: AtomicU64,
    promotions_in: AtomicU64,
    demotions_in: AtomicU64,
    evictions: AtomicU64,
}

impl TierCountersInner {
    fn snapshot(&self) -> TierCounters {
        TierCounters {
            hits: self.hits.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            promotions_in: self.promotions_in.load(Ordering::Relaxed),
            demotions_in: self.demotions_in.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct StatsInner {
    memory: TierCountersInner,
    shared: TierCountersInner,
    archive: TierCountersInner,
    semantic_hits: AtomicU64,
    misses: AtomicU64,
}

/// The multi-tier response cache
pub struct TieredCache {
    config: CacheConfig,
    eviction: EvictionConfig,
    memory: Option<MemoryTier>,
    shared: Option<SharedTier>,
    archive: Option<ArchiveTier>,
    embedder: Arc<dyn Embedder>,
    stats: StatsInner,
}

impl TieredCache {
    /// Assemble the cache from its tier backends
    ///
    /// Passing `None` for a store disables that tier; lookups and stores
    /// silently skip disabled tiers.
    pub fn new(
        config: CacheConfig,
        eviction: EvictionConfig,
        shared_store: Option<Arc<dyn SharedStore>>,
        archive_store: Option<Arc<dyn ArchiveStore>>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        let memory = config
            .memory
            .enabled
            .then(|| MemoryTier::new(config.memory.max_bytes));

        let shared = match (config.shared.enabled, shared_store) {
            (true, Some(store)) => Some(SharedTier::new(store, &config.shared)),
            _ => None,
        };

        let archive = match (config.archive.enabled, archive_store) {
            (true, Some(store)) => Some(ArchiveTier::new(store, &config.archive)),
            _ => None,
        };

        let embedder = embedder.unwrap_or_else(|| {
            Arc::new(HashProjectionEmbedder::new(config.similarity.dimensions))
        });

        Self {
            config,
            eviction,
            memory,
            shared,
            archive,
            embedder,
            stats: StatsInner::default(),
        }
    }

    /// The embedding function in use
    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    /// Similarity configuration
    pub fn similarity(&self) -> &SimilarityConfig {
        &self.config.similarity
    }

    /// Look up an entry by exact key, then by semantic similarity
    ///
    /// An entry is only served when its capability set covers `required`.
    pub async fn lookup(
        &self,
        key: &str,
        required: &HashSet<Capability>,
        semantic: Option<&SemanticQuery>,
    ) -> Option<CacheEntry> {
        let now = Utc::now();

        // Memory tier.
        if let Some(memory) = &self.memory {
            if let Some(entry) = memory.get(key, now) {
                if entry.satisfies(required) {
                    self.stats.memory.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry);
                }
            }
        }

        // Shared tier.
        if let Some(shared) = &self.shared {
            match shared.get_entry(key).await {
                Ok(Some(mut entry)) if entry.satisfies(required) => {
                    entry.touch();
                    self.stats.shared.hits.fetch_add(1, Ordering::Relaxed);

                    if entry.hit_count >= self.config.memory.promote_hit_threshold {
                        self.promote_to_memory(entry.clone()).await;
                    } else if let Err(e) = shared.put_entry(entry.clone()).await {
                        log::debug!("shared hit-count writeback failed for {}: {}", key, e);
                    }
                    return Some(entry);
                }
                Ok(_) => {}
                Err(e) => log::warn!("shared cache degraded on lookup of {}: {}", key, e),
            }
        }

        // Archive tier.
        if let Some(archive) = &self.archive {
            match archive.get_entry(key).await {
                Ok(Some(mut entry)) if entry.satisfies(required) => {
                    entry.touch();
                    self.stats.archive.hits.fetch_add(1, Ordering::Relaxed);

                    // A single archive hit promotes the entry to shared.
                    self.promote_to_shared(entry.clone()).await;
                    let _ = archive.delete(key).await;
                    return Some(entry);
                }
                Ok(_) => {}
                Err(e) => log::warn!("archive cache degraded on lookup of {}: {}", key, e),
            }
        }

        // Semantic fallback.
        if let Some(query) = semantic {
            if query.has_signal() {
                if let Some(hit) = self.semantic_lookup(query).await {
                    return Some(hit);
                }
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn semantic_lookup(&self, query: &SemanticQuery) -> Option<CacheEntry> {
        let bound = self.config.similarity.max_candidates;
        let mut candidates: Vec<CacheEntry> = Vec::new();

        if let Some(memory) = &self.memory {
            candidates.extend(memory.sample_with_embeddings(bound));
        }
        if let Some(shared) = &self.shared {
            match shared.sample_entries(bound).await {
                Ok(entries) => {
                    candidates.extend(entries.into_iter().filter(|e| e.embedding.is_some()))
                }
                Err(e) => log::warn!("shared cache degraded on semantic scan: {}", e),
            }
        }

        let (mut entry, similarity) = semantic::best_match(query, candidates)?;
        entry.value.metadata.insert(
            SIMILARITY_METADATA_KEY.to_string(),
            serde_json::json!(similarity),
        );
        self.stats.semantic_hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Store a completed analysis
    ///
    /// Initial tier placement follows entry size and the submitting
    /// principal's tier: oversized entries go to the archive, large entries
    /// to the shared tier, everything else to memory. Enterprise entries are
    /// pinned to memory unless oversized. A failed store falls back to the
    /// next-lower tier and is never surfaced.
    pub async fn store(&self, entry: CacheEntry, principal: PrincipalTier) {
        let size = entry.size_bytes;

        let target = if size > ARCHIVE_SIZE_THRESHOLD {
            CacheTierLevel::Archive
        } else if principal == PrincipalTier::Enterprise {
            CacheTierLevel::Memory
        } else if size > SHARED_SIZE_THRESHOLD {
            CacheTierLevel::Shared
        } else {
            CacheTierLevel::Memory
        };

        match target {
            CacheTierLevel::Memory => {
                if self.store_memory(entry.clone()).await {
                    return;
                }
                if self.store_shared(&entry, false).await {
                    return;
                }
                self.store_archive(&entry, false).await;
            }
            CacheTierLevel::Shared => {
                if self.store_shared(&entry, false).await {
                    return;
                }
                self.store_archive(&entry, false).await;
            }
            CacheTierLevel::Archive => {
                self.store_archive(&entry, false).await;
            }
        }
    }

    async fn store_memory(&self, entry: CacheEntry) -> bool {
        let Some(memory) = &self.memory else {
            return false;
        };

        let evicted = memory.insert(entry);
        self.stats.memory.stores.fetch_add(1, Ordering::Relaxed);

        // LRU casualties with remaining TTL are demoted, not dropped.
        let now = Utc::now();
        for old in evicted {
            self.stats.memory.evictions.fetch_add(1, Ordering::Relaxed);
            if !old.is_expired(now) {
                if self.store_shared(&old, true).await {
                    self.stats.shared.demotions_in.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        true
    }

    async fn store_shared(&self, entry: &CacheEntry, demotion: bool) -> bool {
        let Some(shared) = &self.shared else {
            return false;
        };

        match shared.put_entry(entry.clone()).await {
            Ok(()) => {
                if !demotion {
                    self.stats.shared.stores.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            Err(e) => {
                log::warn!("shared cache store failed for {}: {}", entry.key, e);
                false
            }
        }
    }

    async fn store_archive(&self, entry: &CacheEntry, demotion: bool) -> bool {
        let Some(archive) = &self.archive else {
            return false;
        };

        match archive.put_entry(entry.clone()).await {
            Ok(()) => {
                if !demotion {
                    self.stats.archive.stores.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            Err(e) => {
                log::warn!("archive store failed for {}: {}", entry.key, e);
                false
            }
        }
    }

    async fn promote_to_memory(&self, entry: CacheEntry) {
        let Some(memory) = &self.memory else {
            return;
        };

        let key = entry.key.clone();
        let evicted = memory.insert(entry);
        self.stats.memory.promotions_in.fetch_add(1, Ordering::Relaxed);

        if let Some(shared) = &self.shared {
            let _ = shared.delete(&key).await;
        }

        let now = Utc::now();
        for old in evicted {
            self.stats.memory.evictions.fetch_add(1, Ordering::Relaxed);
            if !old.is_expired(now) && old.key != key {
                if self.store_shared(&old, true).await {
                    self.stats.shared.demotions_in.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    async fn promote_to_shared(&self, entry: CacheEntry) {
        if self.store_shared(&entry, false).await {
            self.stats.shared.promotions_in.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Delete an entry from every tier
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = false;

        if let Some(memory) = &self.memory {
            removed |= memory.remove(key).is_some();
        }
        if let Some(shared) = &self.shared {
            match shared.delete(key).await {
                Ok(hit) => removed |= hit,
                Err(e) => log::warn!("shared cache delete failed for {}: {}", key, e),
            }
        }
        if let Some(archive) = &self.archive {
            match archive.delete(key).await {
                Ok(hit) => removed |= hit,
                Err(e) => log::warn!("archive delete failed for {}: {}", key, e),
            }
        }

        removed
    }

    /// Drop every cached entry
    pub async fn clear(&self) {
        if let Some(memory) = &self.memory {
            memory.clear();
        }
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.clear().await {
                log::warn!("shared cache clear failed: {}", e);
            }
        }
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.clear().await {
                log::warn!("archive clear failed: {}", e);
            }
        }
    }

    /// Current per-tier counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory: self.stats.memory.snapshot(),
            shared: self.stats.shared.snapshot(),
            archive: self.stats.archive.snapshot(),
            semantic_hits: self.stats.semantic_hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            memory_entries: self.memory.as_ref().map(|m| m.len()).unwrap_or(0),
            memory_bytes: self.memory.as_ref().map(|m| m.bytes()).unwrap_or(0),
        }
    }

    /// Enforce tier budgets; called by the maintenance loop
    ///
    /// Memory demotes LRU entries once strictly above the high watermark.
    /// The shared tier ranks a bounded sample with the configured strategy
    /// and evicts down to its target. The archive sweep is TTL-only.
    pub async fn enforce_budgets(&self) {
        let now = Utc::now();

        if let Some(memory) = &self.memory {
            let watermark = self.eviction.memory.watermark_bytes(memory.max_bytes());
            if memory.bytes() > watermark {
                let target = self.eviction.memory.target_bytes(memory.max_bytes());
                let evicted = memory.evict_to(target);
                for old in evicted {
                    self.stats.memory.evictions.fetch_add(1, Ordering::Relaxed);
                    if !old.is_expired(now) {
                        if self.store_shared(&old, true).await {
                            self.stats.shared.demotions_in.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }

        if let Some(shared) = &self.shared {
            match shared.sample_entries(self.config.similarity.max_candidates.max(256)).await {
                Ok(mut sample) => {
                    // Entries past the archive age move to cold storage
                    // before byte pressure is considered.
                    if self.archive.is_some() && self.config.archive.archive_after_days > 0 {
                        let archive_age =
                            chrono::Duration::days(i64::from(self.config.archive.archive_after_days));
                        let mut kept = Vec::with_capacity(sample.len());
                        for entry in sample {
                            if now - entry.last_accessed >= archive_age {
                                let key = entry.key.clone();
                                if self.store_archive(&entry, true).await {
                                    let _ = shared.delete(&key).await;
                                    self.stats.archive.demotions_in.fetch_add(1, Ordering::Relaxed);
                                    continue;
                                }
                            }
                            kept.push(entry);
                        }
                        sample = kept;
                    }

                    let sampled_bytes: usize = sample.iter().map(|e| e.size_bytes).sum();
                    let watermark = self
                        .eviction
                        .shared
                        .watermark_bytes(self.config.shared.max_bytes);

                    if sampled_bytes > watermark {
                        let target = self
                            .eviction
                            .shared
                            .target_bytes(self.config.shared.max_bytes);
                        let ranked = eviction::rank_for_eviction(&sample, &self.eviction.shared, now);

                        let mut remaining = sampled_bytes;
                        let by_key: std::collections::HashMap<&str, usize> =
                            sample.iter().map(|e| (e.key.as_str(), e.size_bytes)).collect();

                        for key in ranked {
                            if remaining <= target {
                                break;
                            }
                            match shared.delete(&key).await {
                                Ok(true) => {
                                    remaining -=
                                        by_key.get(key.as_str()).copied().unwrap_or(0).min(remaining);
                                    self.stats.shared.evictions.fetch_add(1, Ordering::Relaxed);
                                }
                                Ok(false) => {}
                                Err(e) => log::warn!("shared eviction failed for {}: {}", key, e),
                            }
                        }
                    }
                }
                Err(e) => log::warn!("shared cache degraded during eviction sweep: {}", e),
            }
        }

        if let Some(archive) = &self.archive {
            match archive.sweep_expired(1024).await {
                Ok(removed) if removed > 0 => {
                    self.stats
                        .archive
                        .evictions
                        .fetch_add(removed as u64, Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(e) => log::warn!("archive sweep failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::PrincipalTier;

    fn cache() -> TieredCache {
        TieredCache::new(
            CacheConfig::default(),
            EvictionConfig::default(),
            Some(Arc::new(InMemorySharedStore::new())),
            Some(Arc::new(InMemoryArchiveStore::new())),
            None,
        )
    }

    fn entry(key: &str, caps: &[Capability]) -> CacheEntry {
        CacheEntry::new(
            key,
            "b1",
            caps.iter().copied().collect(),
            CacheValue::from_artifact(serde_json::json!({"k": key})),
            3600,
        )
    }

    #[tokio::test]
    async fn test_store_then_exact_lookup() {
        let cache = cache();
        cache
            .store(entry("fp-1", &[Capability::DocumentAnalysis]), PrincipalTier::Free)
            .await;

        let required: HashSet<Capability> = [Capability::DocumentAnalysis].into_iter().collect();
        let hit = cache.lookup("fp-1", &required, None).await.unwrap();
        assert_eq!(hit.key, "fp-1");
        assert_eq!(cache.stats().memory.hits, 1);
    }

    #[tokio::test]
    async fn test_capability_mismatch_is_a_miss() {
        let cache = cache();
        cache
            .store(entry("fp-1", &[Capability::DocumentAnalysis]), PrincipalTier::Free)
            .await;

        let required: HashSet<Capability> =
            [Capability::LegalInterpretation].into_iter().collect();
        assert!(cache.lookup("fp-1", &required, None).await.is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_shared_hit_promotes_after_threshold() {
        let cache = cache();

        // Place directly in the shared tier.
        let mut e = entry("fp-warm", &[]);
        e.hit_count = 4;
        cache.shared.as_ref().unwrap().put_entry(e).await.unwrap();

        let none: HashSet<Capability> = HashSet::new();
        // Fifth hit crosses the promotion threshold.
        let hit = cache.lookup("fp-warm", &none, None).await.unwrap();
        assert_eq!(hit.hit_count, 5);
        assert_eq!(cache.stats().memory.promotions_in, 1);

        // Entry is now served from memory.
        cache.lookup("fp-warm", &none, None).await.unwrap();
        assert_eq!(cache.stats().memory.hits, 1);
    }

    #[tokio::test]
    async fn test_archive_hit_promotes_to_shared() {
        let cache = cache();
        cache
            .archive
            .as_ref()
            .unwrap()
            .put_entry(entry("fp-cold", &[]))
            .await
            .unwrap();

        let none: HashSet<Capability> = HashSet::new();
        let hit = cache.lookup("fp-cold", &none, None).await.unwrap();
        assert_eq!(hit.key, "fp-cold");
        assert_eq!(cache.stats().archive.hits, 1);
        assert_eq!(cache.stats().shared.promotions_in, 1);

        // Next lookup is served by the shared tier.
        cache.lookup("fp-cold", &none, None).await.unwrap();
        assert_eq!(cache.stats().shared.hits, 1);
    }

    #[tokio::test]
    async fn test_semantic_lookup_records_similarity() {
        let cache = cache();
        cache
            .store(
                entry("fp-sem", &[Capability::DocumentAnalysis])
                    .with_embedding(vec![1.0, 0.0, 0.0]),
                PrincipalTier::Free,
            )
            .await;

        let query = SemanticQuery {
            embedding: vec![0.99, 0.01, 0.0],
            threshold: 0.9,
            capabilities: [Capability::DocumentAnalysis].into_iter().collect(),
            document_type: None,
        };
        let required = query.capabilities.clone();

        let hit = cache.lookup("different-key", &required, Some(&query)).await.unwrap();
        assert_eq!(hit.key, "fp-sem");
        assert!(hit.value.metadata.contains_key(SIMILARITY_METADATA_KEY));
        assert_eq!(cache.stats().semantic_hits, 1);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache = cache();
        cache.store(entry("fp-1", &[]), PrincipalTier::Free).await;

        assert!(cache.delete("fp-1").await);
        assert!(!cache.delete("fp-1").await);

        cache.store(entry("fp-2", &[]), PrincipalTier::Free).await;
        cache.clear().await;
        let none: HashSet<Capability> = HashSet::new();
        assert!(cache.lookup("fp-2", &none, None).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_tiers_degrade_silently() {
        let mut config = CacheConfig::default();
        config.shared.enabled = false;
        config.archive.enabled = false;

        let cache = TieredCache::new(config, EvictionConfig::default(), None, None, None);
        cache.store(entry("fp-1", &[]), PrincipalTier::Free).await;

        let none: HashSet<Capability> = HashSet::new();
        assert!(cache.lookup("fp-1", &none, None).await.is_some());
    }
}
