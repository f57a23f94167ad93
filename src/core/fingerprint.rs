//! Content fingerprints used as cache keys
//!
//! A request fingerprint is a SHA-256 digest over the canonical payload text
//! and the sorted required-capability set, so two requests asking for the
//! same analysis of the same document share a cache key regardless of field
//! ordering or submission metadata.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::request::Capability;

/// Fingerprint of a document payload alone
pub fn document_fingerprint(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_text(payload).as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint of a payload combined with its required capability set
pub fn request_fingerprint(
    payload: &serde_json::Value,
    capabilities: &HashSet<Capability>,
) -> String {
    let mut caps: Vec<&str> = capabilities.iter().map(|c| c.as_str()).collect();
    caps.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(canonical_text(payload).as_bytes());
    for cap in caps {
        hasher.update(b"|");
        hasher.update(cap.as_bytes());
    }
    hex::encode(hasher.finalize())
}

// serde_json renders object keys in map order; requests built from the same
// source document therefore produce identical canonical text.
fn canonical_text(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
