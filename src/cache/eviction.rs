//! Eviction strategies and per-tier eviction policy
//!
//! The memory tier evicts by LRU through its own accounting; this module
//! ranks shared-tier candidates and guards protected keys. The hybrid
//! strategy combines last-access recency, hit count, and remaining TTL.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::entry::CacheEntry;

/// Eviction strategy for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionStrategy {
    Lru,
    Lfu,
    Fifo,
    Ttl,
    Cost,
    Hybrid,
}

/// Per-tier eviction policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionPolicy {
    pub strategy: EvictionStrategy,
    /// Utilization percentage above which eviction starts
    pub high_watermark_pct: f64,
    /// Utilization percentage eviction drives down to
    pub target_pct: f64,
    /// Keys matching any pattern are evicted last
    pub protected_patterns: Vec<String>,
    /// Entries older than this are always eviction candidates
    pub max_age_seconds: Option<u64>,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            strategy: EvictionStrategy::Hybrid,
            high_watermark_pct: 90.0,
            target_pct: 70.0,
            protected_patterns: Vec::new(),
            max_age_seconds: None,
        }
    }
}

/// Eviction configuration across all tiers
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvictionConfig {
    pub memory: EvictionPolicy,
    pub shared: EvictionPolicy,
    pub archive: EvictionPolicy,
}

impl EvictionPolicy {
    /// Compile protected-key patterns, skipping invalid ones with a warning
    pub fn compiled_patterns(&self) -> Vec<Regex> {
        self.protected_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    log::warn!("invalid protected-key pattern {:?}: {}", p, e);
                    None
                }
            })
            .collect()
    }

    /// Bytes at which eviction triggers for a tier budget
    ///
    /// Strictly above the watermark: a tier exactly at the mark does not
    /// evict.
    pub fn watermark_bytes(&self, max_bytes: usize) -> usize {
        (max_bytes as f64 * self.high_watermark_pct / 100.0) as usize
    }

    /// Bytes eviction drives the tier down to
    pub fn target_bytes(&self, max_bytes: usize) -> usize {
        (max_bytes as f64 * self.target_pct / 100.0) as usize
    }
}

// Hybrid ranking weights.
const HYBRID_RECENCY_WEIGHT: f64 = 0.5;
const HYBRID_FREQUENCY_WEIGHT: f64 = 0.3;
const HYBRID_TTL_WEIGHT: f64 = 0.2;

/// Rank entries most-evictable first under a strategy
///
/// Protected entries sort to the end so they are only reclaimed when
/// everything unprotected was insufficient to reach the target.
pub fn rank_for_eviction(
    entries: &[CacheEntry],
    policy: &EvictionPolicy,
    now: DateTime<Utc>,
) -> Vec<String> {
    let patterns = policy.compiled_patterns();
    let is_protected =
        |key: &str| -> bool { patterns.iter().any(|re| re.is_match(key)) };

    let mut scored: Vec<(&CacheEntry, bool, f64)> = entries
        .iter()
        .map(|e| (e, is_protected(&e.key), eviction_score(e, policy.strategy, now)))
        .collect();

    // Unprotected before protected; higher score = more evictable.
    scored.sort_by(|a, b| {
        a.1.cmp(&b.1)
            .then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
    });

    scored.into_iter().map(|(e, _, _)| e.key.clone()).collect()
}

fn eviction_score(entry: &CacheEntry, strategy: EvictionStrategy, now: DateTime<Utc>) -> f64 {
    let idle_secs = (now - entry.last_accessed).num_seconds().max(0) as f64;
    let age_secs = (now - entry.created_at).num_seconds().max(0) as f64;
    let remaining_secs = entry.remaining_ttl(now).as_secs_f64();
    let total_ttl_secs = (entry.expires_at - entry.created_at).num_seconds().max(1) as f64;

    match strategy {
        EvictionStrategy::Lru => idle_secs,
        EvictionStrategy::Lfu => 1.0 / (1.0 + entry.hit_count as f64),
        EvictionStrategy::Fifo => age_secs,
        EvictionStrategy::Ttl => -remaining_secs,
        // Large, rarely hit entries cost the most to keep resident.
        EvictionStrategy::Cost => entry.size_bytes as f64 / (1.0 + entry.hit_count as f64),
        EvictionStrategy::Hybrid => {
            let recency = idle_secs / (idle_secs + 600.0);
            let infrequency = 1.0 / (1.0 + entry.hit_count as f64);
            let ttl_spent = 1.0 - (remaining_secs / total_ttl_secs).clamp(0.0, 1.0);

            HYBRID_RECENCY_WEIGHT * recency
                + HYBRID_FREQUENCY_WEIGHT * infrequency
                + HYBRID_TTL_WEIGHT * ttl_spent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheValue;
    use std::collections::HashSet;

    fn entry(key: &str, hits: u64, idle_secs: i64) -> CacheEntry {
        let mut e = CacheEntry::new(
            key,
            "b1",
            HashSet::new(),
            CacheValue::from_artifact(serde_json::Value::Null),
            3600,
        );
        e.hit_count = hits;
        e.last_accessed = Utc::now() - chrono::Duration::seconds(idle_secs);
        e
    }

    #[test]
    fn test_lru_ranks_idle_first() {
        let entries = vec![entry("hot", 0, 10), entry("cold", 0, 5000)];
        let ranked = rank_for_eviction(&entries, &EvictionPolicy {
            strategy: EvictionStrategy::Lru,
            ..Default::default()
        }, Utc::now());

        assert_eq!(ranked[0], "cold");
    }

    #[test]
    fn test_lfu_ranks_unpopular_first() {
        let entries = vec![entry("popular", 50, 10), entry("unpopular", 1, 10)];
        let ranked = rank_for_eviction(&entries, &EvictionPolicy {
            strategy: EvictionStrategy::Lfu,
            ..Default::default()
        }, Utc::now());

        assert_eq!(ranked[0], "unpopular");
    }

    #[test]
    fn test_hybrid_prefers_idle_unpopular_entries() {
        let entries = vec![
            entry("hot-frequent", 40, 5),
            entry("cold-rare", 0, 7200),
        ];
        let ranked = rank_for_eviction(&entries, &EvictionPolicy::default(), Utc::now());
        assert_eq!(ranked[0], "cold-rare");
    }

    #[test]
    fn test_protected_keys_sort_last() {
        let entries = vec![entry("session:abc", 0, 9000), entry("doc:xyz", 20, 5)];
        let policy = EvictionPolicy {
            protected_patterns: vec!["^session:".to_string()],
            ..Default::default()
        };

        let ranked = rank_for_eviction(&entries, &policy, Utc::now());
        assert_eq!(ranked.last().unwrap(), "session:abc");
    }

    #[test]
    fn test_invalid_patterns_are_skipped() {
        let policy = EvictionPolicy {
            protected_patterns: vec!["([unclosed".to_string(), "^ok$".to_string()],
            ..Default::default()
        };
        assert_eq!(policy.compiled_patterns().len(), 1);
    }

    #[test]
    fn test_watermark_math() {
        let policy = EvictionPolicy::default();
        assert_eq!(policy.watermark_bytes(1000), 900);
        assert_eq!(policy.target_bytes(1000), 700);
    }
}
