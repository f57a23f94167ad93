//! Cache entry model shared by all tiers

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::request::Capability;

/// Physical tier an entry currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheTierLevel {
    Memory,
    Shared,
    Archive,
}

/// Cached analysis artifact with its metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheValue {
    pub artifact: serde_json::Value,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CacheValue {
    /// Wrap a bare artifact with empty metadata
    pub fn from_artifact(artifact: serde_json::Value) -> Self {
        Self {
            artifact,
            metadata: HashMap::new(),
        }
    }
}

/// One cached analysis result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Entry key; equal to the request fingerprint for exact lookups
    pub key: String,
    pub document_fingerprint: Option<String>,
    pub request_fingerprint: String,
    /// Backend that produced the value
    pub backend_id: String,
    /// Capabilities the cached analysis satisfies
    pub capabilities: HashSet<Capability>,
    pub document_type: Option<String>,
    pub value: CacheValue,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub hit_count: u64,
    pub tier: CacheTierLevel,
    pub compressed: bool,
    pub size_bytes: usize,
}

impl CacheEntry {
    /// Create an entry keyed by its request fingerprint
    pub fn new(
        request_fingerprint: impl Into<String>,
        backend_id: impl Into<String>,
        capabilities: HashSet<Capability>,
        value: CacheValue,
        ttl_seconds: u64,
    ) -> Self {
        let now = Utc::now();
        let key = request_fingerprint.into();
        let size_bytes = estimate_size(&value);

        Self {
            request_fingerprint: key.clone(),
            key,
            document_fingerprint: None,
            backend_id: backend_id.into(),
            capabilities,
            document_type: None,
            value,
            embedding: None,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_seconds as i64),
            last_accessed: now,
            hit_count: 0,
            tier: CacheTierLevel::Memory,
            compressed: false,
            size_bytes,
        }
    }

    /// Attach the source document fingerprint
    pub fn with_document_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.document_fingerprint = Some(fingerprint.into());
        self
    }

    /// Attach the document type used by semantic filters
    pub fn with_document_type(mut self, document_type: impl Into<String>) -> Self {
        self.document_type = Some(document_type.into());
        self
    }

    /// Attach an embedding vector for semantic matching
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Whether the entry has outlived its TTL
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining TTL, zero when expired
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }

    /// Record a hit
    pub fn touch(&mut self) {
        self.hit_count += 1;
        self.last_accessed = Utc::now();
    }

    /// Capability check applied before an entry may be served
    pub fn satisfies(&self, required: &HashSet<Capability>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

/// Approximate byte size of a value as stored
pub fn estimate_size(value: &CacheValue) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}
