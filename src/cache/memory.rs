//! In-process memory tier: an LRU bounded by a byte budget
//!
//! Eviction is driven by bytes rather than entry count because analysis
//! artifacts vary from a few hundred bytes to several megabytes. Evicted
//! entries are returned to the caller so the tiered cache can demote them
//! instead of dropping them.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cache::entry::{CacheEntry, CacheTierLevel};

/// Memory tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryTierConfig {
    pub enabled: bool,
    /// Byte budget for resident entries
    pub max_bytes: usize,
    pub default_ttl_seconds: u64,
    /// Shared-tier hits at which an entry is promoted into memory
    pub promote_hit_threshold: u64,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 64 * 1024 * 1024,
            default_ttl_seconds: 86_400,
            promote_hit_threshold: 5,
        }
    }
}

/// The in-process tier
pub struct MemoryTier {
    entries: Mutex<LruCache<String, CacheEntry>>,
    max_bytes: usize,
    current_bytes: Mutex<usize>,
}

impl MemoryTier {
    /// Create a tier with the given byte budget
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            max_bytes,
            current_bytes: Mutex::new(0),
        }
    }

    /// Look up an entry, recording the hit
    pub fn get(&self, key: &str, now: chrono::DateTime<chrono::Utc>) -> Option<CacheEntry> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(key) {
            if entry.is_expired(now) {
                let size = entry.size_bytes;
                entries.pop(key);
                let mut current = self.current_bytes.lock();
                *current = current.saturating_sub(size);
                return None;
            }
            entry.touch();
            return Some(entry.clone());
        }

        None
    }

    /// Insert an entry, evicting least-recently-used entries past the budget
    ///
    /// Returns the entries displaced by this insert so they can be demoted.
    pub fn insert(&self, mut entry: CacheEntry) -> Vec<CacheEntry> {
        entry.tier = CacheTierLevel::Memory;
        entry.compressed = false;

        let mut entries = self.entries.lock();
        let mut current = self.current_bytes.lock();

        if let Some(old) = entries.pop(&entry.key) {
            *current = current.saturating_sub(old.size_bytes);
        }

        *current += entry.size_bytes;
        entries.push(entry.key.clone(), entry);

        let mut evicted = Vec::new();
        while *current > self.max_bytes {
            match entries.pop_lru() {
                Some((_, old)) => {
                    *current = current.saturating_sub(old.size_bytes);
                    evicted.push(old);
                }
                None => break,
            }
        }

        evicted
    }

    /// Remove an entry
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        let mut entries = self.entries.lock();
        let removed = entries.pop(key);
        if let Some(entry) = &removed {
            let mut current = self.current_bytes.lock();
            *current = current.saturating_sub(entry.size_bytes);
        }
        removed
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
        *self.current_bytes.lock() = 0;
    }

    /// Evict least-recently-used entries until at most `target_bytes` remain
    pub fn evict_to(&self, target_bytes: usize) -> Vec<CacheEntry> {
        let mut entries = self.entries.lock();
        let mut current = self.current_bytes.lock();

        let mut evicted = Vec::new();
        while *current > target_bytes {
            match entries.pop_lru() {
                Some((_, old)) => {
                    *current = current.saturating_sub(old.size_bytes);
                    evicted.push(old);
                }
                None => break,
            }
        }

        evicted
    }

    /// Up to `limit` resident entries carrying embeddings, hottest first
    pub fn sample_with_embeddings(&self, limit: usize) -> Vec<CacheEntry> {
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|(_, e)| e.embedding.is_some())
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Resident entry count
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the tier is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently resident
    pub fn bytes(&self) -> usize {
        *self.current_bytes.lock()
    }

    /// Byte budget
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}
