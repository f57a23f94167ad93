//! # FINELENS - AI Document Analysis Scheduling Engine
//!
//! A cost-aware model-request scheduler with a multi-tier response cache.
//!
//! ## Architecture
//!
//! - `core`: time sources, identifiers, and content fingerprints
//! - `request`: the analysis request model and capability vocabulary
//! - `registry`: declared backends, health state machine, status events
//! - `metrics`: rolling per-backend counters, percentiles, hourly roll-ups
//! - `cache`: three-tier response cache with exact and semantic lookup
//! - `routing`: capability filtering, rule cascade, composite scoring
//! - `queue`: per-backend priority queues, dispatchers, retries, cancellation
//! - `scheduler`: the submission facade tying everything together
//! - `maintenance`: health probes, eviction sweeps, metric roll-ups
//!
//! ## Example
//!
//! ```rust,no_run
//! use finelens::config::FinelensConfig;
//! use finelens::registry::{BackendKind, BackendSpec};
//! use finelens::request::{AnalysisRequest, Capability, PrincipalTier, RequestKind};
//! use finelens::scheduler::Scheduler;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = FinelensConfig::default();
//! config.backends.push(
//!     BackendSpec::new("primary-1", BackendKind::Primary, "http://analysis-1.internal")
//!         .with_capability(Capability::DocumentAnalysis),
//! );
//!
//! let scheduler = Scheduler::start(config, Default::default()).await?;
//!
//! let request = AnalysisRequest::new(
//!     "acct-42",
//!     PrincipalTier::Premium,
//!     RequestKind::DocAnalysis,
//!     serde_json::json!({"text": "..."}),
//! )
//! .with_capability(Capability::DocumentAnalysis);
//!
//! let mut handle = scheduler.submit(request).await?;
//! let outcome = handle.wait(None).await;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Foundational utilities
pub mod core;

// Error types
pub mod error;

// Request model
pub mod request;

// Startup configuration
pub mod config;

// Backend registry
pub mod registry;

// Metrics store
pub mod metrics;

// Tiered response cache
pub mod cache;

// Routing policy
pub mod routing;

// Queues and dispatchers
pub mod queue;

// Scheduler facade
pub mod scheduler;

// Maintenance loop
pub mod maintenance;

// Re-export commonly used types
pub use cache::{CacheStats, TieredCache};
pub use config::FinelensConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use metrics::{BackendMetricsSnapshot, MetricsStore};
pub use registry::{AnalysisBackend, BackendKind, BackendRegistry, BackendSpec, BackendStatus};
pub use request::{
    AnalysisRequest, Capability, Complexity, PrincipalTier, RequestKind, RequestPriority,
};
pub use routing::RoutingDecision;
pub use scheduler::{AwaitOutcome, JobHandle, JobStatusReport, Scheduler};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
