//! Wire codec for cache entries stored outside process memory
//!
//! This module provides:
//! - Binary serialization using bincode
//! - Transparent deflate compression above a size threshold
//! - Checksum validation to detect corrupted shared-tier payloads

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression as ZlibLevel;
use serde::{Deserialize, Serialize};

use crate::cache::entry::CacheEntry;
use crate::cache::{CacheError, CacheResult};

/// Compression applied to an encoded payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Deflate,
}

/// Codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Compress payloads at or above this many bytes; `None` disables
    pub compression_threshold: Option<usize>,
    /// Deflate level (0-9)
    pub compression_level: u32,
    /// Enable checksum validation
    pub enable_checksum: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_threshold: Some(1024),
            compression_level: 6,
            enable_checksum: true,
        }
    }
}

impl CodecConfig {
    /// A codec that never compresses
    pub fn uncompressed() -> Self {
        Self {
            compression_threshold: None,
            ..Default::default()
        }
    }
}

/// Encoded payload with framing metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedData {
    pub compression: Compression,
    pub original_size: usize,
    pub encoded_size: usize,
    pub checksum: Option<u64>,
    pub data: Vec<u8>,
}

impl EncodedData {
    /// Encoded bytes / original bytes
    pub fn compression_ratio(&self) -> f64 {
        if self.original_size == 0 {
            return 1.0;
        }
        self.encoded_size as f64 / self.original_size as f64
    }

    fn compute_checksum(data: &[u8]) -> u64 {
        data.iter().fold(0u64, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u64))
    }

    fn verify_checksum(&self) -> bool {
        match self.checksum {
            Some(expected) => Self::compute_checksum(&self.data) == expected,
            None => true,
        }
    }
}

/// Encode an entry for the shared or archive tier
///
/// The entry body is JSON (analysis artifacts are arbitrary JSON trees);
/// the frame around it is compact bincode.
pub fn encode_entry(entry: &CacheEntry, config: &CodecConfig) -> CacheResult<Vec<u8>> {
    let serialized = serde_json::to_vec(entry)?;
    let original_size = serialized.len();

    let (data, compression) = match config.compression_threshold {
        Some(threshold) if original_size >= threshold => {
            let mut encoder =
                ZlibEncoder::new(Vec::new(), ZlibLevel::new(config.compression_level.min(9)));
            encoder
                .write_all(&serialized)
                .map_err(|e| CacheError::Corrupt(format!("compression failed: {}", e)))?;
            let compressed = encoder
                .finish()
                .map_err(|e| CacheError::Corrupt(format!("compression failed: {}", e)))?;
            (compressed, Compression::Deflate)
        }
        _ => (serialized, Compression::None),
    };

    let encoded = EncodedData {
        compression,
        original_size,
        encoded_size: data.len(),
        checksum: config
            .enable_checksum
            .then(|| EncodedData::compute_checksum(&data)),
        data,
    };

    Ok(bincode::serialize(&encoded)?)
}

/// Decode an entry previously produced by [`encode_entry`]
///
/// Returns the entry together with whether its payload was compressed on the
/// wire, which callers reflect into the entry's `compressed` flag.
pub fn decode_entry(bytes: &[u8]) -> CacheResult<(CacheEntry, bool)> {
    let encoded: EncodedData = bincode::deserialize(bytes)?;

    if !encoded.verify_checksum() {
        return Err(CacheError::Corrupt("checksum mismatch".to_string()));
    }

    let serialized = match encoded.compression {
        Compression::None => encoded.data,
        Compression::Deflate => {
            let mut decoder = ZlibDecoder::new(encoded.data.as_slice());
            let mut out = Vec::with_capacity(encoded.original_size);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CacheError::Corrupt(format!("decompression failed: {}", e)))?;
            out
        }
    };

    let entry: CacheEntry = serde_json::from_slice(&serialized)?;
    Ok((entry, encoded.compression == Compression::Deflate))
}
