//! Semantic similarity matching over entry embeddings
//!
//! Exact-key misses can still be served by a previously analyzed document
//! that is close enough in embedding space. The embedding function is a
//! plug-point: production deployments wire a model-backed embedder, while
//! the default is a deterministic projection so behavior is reproducible.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::entry::CacheEntry;
use crate::request::Capability;

/// Similarity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityConfig {
    /// Minimum cosine similarity for a semantic hit, in [0, 1]
    pub threshold: f64,
    /// Embedding dimensionality
    pub dimensions: usize,
    /// Identifier of the embedding function in use
    pub embedder: String,
    /// Bound on candidate entries scanned per lookup
    pub max_candidates: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            dimensions: 64,
            embedder: "hash-projection-v1".to_string(),
            max_candidates: 256,
        }
    }
}

/// Embedding function plug-point
pub trait Embedder: Send + Sync {
    /// Embed a text into a fixed-dimension vector
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Output dimensionality
    fn dimensions(&self) -> usize;

    /// Stable identifier of this embedder
    fn id(&self) -> &str;
}

/// Deterministic, non-semantic projection of a text fingerprint
///
/// Expands SHA-256 output into the requested dimensionality and normalizes
/// to unit length. Equal texts always produce equal vectors.
pub struct HashProjectionEmbedder {
    dimensions: usize,
}

impl HashProjectionEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Embedder for HashProjectionEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.dimensions);
        let mut counter: u32 = 0;

        while values.len() < self.dimensions {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_be_bytes());
            let digest = hasher.finalize();

            for byte in digest.iter() {
                if values.len() >= self.dimensions {
                    break;
                }
                values.push(*byte as f32 / 127.5 - 1.0);
            }
            counter += 1;
        }

        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        }
        values
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn id(&self) -> &str {
        "hash-projection-v1"
    }
}

/// A semantic lookup attached to a cache probe
#[derive(Debug, Clone)]
pub struct SemanticQuery {
    pub embedding: Vec<f32>,
    pub threshold: f64,
    pub capabilities: HashSet<Capability>,
    pub document_type: Option<String>,
}

impl SemanticQuery {
    /// Whether the query vector carries any signal
    pub fn has_signal(&self) -> bool {
        self.embedding.iter().any(|v| *v != 0.0)
    }
}

/// Cosine similarity; zero for mismatched dimensions or zero-norm vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Best candidate at or above the query threshold
///
/// Candidates only count when their capability set covers the query's and,
/// when the query names a document type, the types match.
pub fn best_match(
    query: &SemanticQuery,
    candidates: impl IntoIterator<Item = CacheEntry>,
) -> Option<(CacheEntry, f64)> {
    let mut best: Option<(CacheEntry, f64)> = None;

    for candidate in candidates {
        if !candidate.satisfies(&query.capabilities) {
            continue;
        }
        if let Some(wanted) = &query.document_type {
            if candidate.document_type.as_deref() != Some(wanted.as_str()) {
                continue;
            }
        }
        let Some(embedding) = &candidate.embedding else {
            continue;
        };

        let similarity = cosine_similarity(&query.embedding, embedding);
        if similarity < query.threshold {
            continue;
        }

        match &best {
            Some((_, current)) if *current >= similarity => {}
            _ => best = Some((candidate, similarity)),
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheValue;

    fn entry(key: &str, caps: &[Capability], embedding: Vec<f32>) -> CacheEntry {
        CacheEntry::new(
            key,
            "b1",
            caps.iter().copied().collect(),
            CacheValue::from_artifact(serde_json::Value::Null),
            3600,
        )
        .with_embedding(embedding)
    }

    fn query(embedding: Vec<f32>, caps: &[Capability]) -> SemanticQuery {
        SemanticQuery {
            embedding,
            threshold: 0.8,
            capabilities: caps.iter().copied().collect(),
            document_type: None,
        }
    }

    #[test]
    fn test_cosine_identity_and_orthogonality() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_embedder_is_deterministic() {
        let embedder = HashProjectionEmbedder::new(64);
        let a = embedder.embed("terms of service");
        let b = embedder.embed("terms of service");
        let c = embedder.embed("privacy policy");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_best_match_honors_threshold() {
        let q = query(vec![1.0, 0.0], &[]);
        let close = entry("close", &[], vec![0.95, 0.05]);
        let far = entry("far", &[], vec![0.0, 1.0]);

        let (found, score) = best_match(&q, vec![far, close]).unwrap();
        assert_eq!(found.key, "close");
        assert!(score >= 0.8);

        let q_strict = SemanticQuery {
            threshold: 0.9999,
            ..query(vec![0.5, 0.5], &[])
        };
        assert!(best_match(&q_strict, vec![entry("e", &[], vec![1.0, 0.0])]).is_none());
    }

    #[test]
    fn test_capability_filter_gates_matches() {
        let q = query(vec![1.0, 0.0], &[Capability::LegalInterpretation]);
        let wrong_caps = entry("wrong", &[Capability::DocumentAnalysis], vec![1.0, 0.0]);
        let right_caps = entry(
            "right",
            &[Capability::DocumentAnalysis, Capability::LegalInterpretation],
            vec![1.0, 0.0],
        );

        let (found, _) = best_match(&q, vec![wrong_caps, right_caps]).unwrap();
        assert_eq!(found.key, "right");
    }

    #[test]
    fn test_document_type_filter() {
        let mut q = query(vec![1.0, 0.0], &[]);
        q.document_type = Some("tos".to_string());

        let untyped = entry("untyped", &[], vec![1.0, 0.0]);
        let typed = entry("typed", &[], vec![1.0, 0.0]).with_document_type("tos");

        let (found, _) = best_match(&q, vec![untyped, typed]).unwrap();
        assert_eq!(found.key, "typed");
    }

    #[test]
    fn test_zero_norm_query_has_no_signal() {
        let q = query(vec![0.0, 0.0, 0.0], &[]);
        assert!(!q.has_signal());
        assert!(best_match(&q, vec![entry("e", &[], vec![1.0, 0.0, 0.0])]).is_none());
    }
}
