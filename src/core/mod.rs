//! Foundational utilities: time, identifiers, and content hashing
//!
//! This module provides:
//! - Monotonic and wall-clock time helpers
//! - Request and job identifier generation
//! - Stable content fingerprints used as cache keys

pub mod clock;
pub mod fingerprint;
pub mod ids;

pub use clock::Clock;
pub use fingerprint::{document_fingerprint, request_fingerprint};
