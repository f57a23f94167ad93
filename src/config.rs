//! Startup configuration
//!
//! All tunable behavior is enumerated here and in the per-module config
//! structs it aggregates. Defaults are production values; tests override
//! individual fields.

use serde::{Deserialize, Serialize};

use crate::cache::{CacheConfig, EvictionConfig};
use crate::registry::BackendSpec;

/// Routing and queue thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Load fraction above which a backend stops taking fast-path traffic
    pub available_load: f64,
    /// Load fraction above which a backend stops taking free-tier traffic
    pub free_tier_load: f64,
    /// Pending jobs per backend before enqueue rejects as saturated
    pub queue_saturation_ceiling: usize,
    /// Rate-shaping delay applied to free-tier, non-urgent jobs
    pub free_tier_delay_ms: u64,
    /// Initial retry backoff; doubles per attempt
    pub retry_initial_ms: u64,
    /// Attempts per job including the first
    pub max_attempts: u32,
    pub completed_retention_secs: u64,
    pub completed_retention_max: usize,
    pub failed_retention_secs: u64,
    pub failed_retention_max: usize,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            available_load: 0.9,
            free_tier_load: 0.8,
            queue_saturation_ceiling: 1000,
            free_tier_delay_ms: 1000,
            retry_initial_ms: 2000,
            max_attempts: 3,
            completed_retention_secs: 3600,
            completed_retention_max: 100,
            failed_retention_secs: 86_400,
            failed_retention_max: 500,
        }
    }
}

/// Maintenance loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            probe_timeout_secs: 5,
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FinelensConfig {
    /// Shared KV store endpoint; `None` keeps the shared tier in-process
    pub redis_url: Option<String>,
    /// Archive store path; `None` keeps the archive in-process
    pub archive_path: Option<String>,
    pub backends: Vec<BackendSpec>,
    pub cache: CacheConfig,
    pub eviction: EvictionConfig,
    pub thresholds: ThresholdConfig,
    pub maintenance: MaintenanceConfig,
}
