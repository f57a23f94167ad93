//! Backend registry with capability lookup and health state tracking
//!
//! This module provides:
//! - Declared backend specifications (capabilities, limits, cost, tags)
//! - Registration idempotent on backend identity
//! - Snapshot reads that never block concurrent mutation
//! - A probe-driven status state machine
//! - Status-change events delivered over a broadcast channel

pub mod backend;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::request::Capability;

pub use backend::{AnalysisBackend, AnalysisOutcome, BackendError, CallContext, HttpAnalysisBackend};

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Backend not found: {0}")]
    BackendNotFound(String),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Declared role of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Primary,
    Complex,
    Backup,
    Business,
    Specialized,
}

/// Runtime status of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendStatus {
    Available,
    Busy,
    Degraded,
    Unavailable,
    Maintenance,
}

impl BackendStatus {
    /// Whether the router may consider a backend in this status
    pub fn is_routable(&self) -> bool {
        !matches!(self, BackendStatus::Unavailable | BackendStatus::Maintenance)
    }
}

/// Declared backend specification
///
/// Everything here is configuration supplied at startup; runtime state lives
/// in the registry entry, never in the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    pub id: String,
    pub name: String,
    pub kind: BackendKind,
    pub endpoint: String,
    pub capabilities: HashSet<Capability>,
    /// Declared mean latency in milliseconds
    pub avg_latency_ms: u64,
    /// Declared cost per request in account currency units
    pub cost_per_request: f64,
    /// Maximum concurrent in-flight calls
    pub max_concurrent: usize,
    /// Per-call timeout in seconds
    pub timeout_seconds: u64,
    /// Base routing priority, higher wins
    pub base_priority: u8,
    pub tags: HashMap<String, String>,
    pub initial_status: BackendStatus,
}

impl BackendSpec {
    /// Create a spec with conservative defaults
    pub fn new(id: impl Into<String>, kind: BackendKind, endpoint: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            endpoint: endpoint.into(),
            capabilities: HashSet::new(),
            avg_latency_ms: 30_000,
            cost_per_request: 0.01,
            max_concurrent: 4,
            timeout_seconds: 120,
            base_priority: 5,
            tags: HashMap::new(),
            initial_status: BackendStatus::Available,
        }
    }

    /// Add a declared capability
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Replace the declared capability set
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    /// Set declared mean latency
    pub fn with_avg_latency_ms(mut self, latency_ms: u64) -> Self {
        self.avg_latency_ms = latency_ms;
        self
    }

    /// Set declared cost per request
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_per_request = cost;
        self
    }

    /// Set the in-flight concurrency limit
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Set the per-call timeout
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Set the base routing priority
    pub fn with_base_priority(mut self, priority: u8) -> Self {
        self.base_priority = priority;
        self
    }

    /// Add an arbitrary tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Whether this backend is tagged for business workloads
    pub fn has_business_tag(&self) -> bool {
        self.tags.contains_key("business")
            || self.tags.values().any(|v| v.contains("business"))
            || self.kind == BackendKind::Business
    }
}

/// A status transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub backend_id: String,
    pub from: BackendStatus,
    pub to: BackendStatus,
    pub at: DateTime<Utc>,
}

/// Read-only view of a registered backend
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub spec: BackendSpec,
    pub status: BackendStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub in_flight: usize,
    /// in-flight / max-in-flight, in [0, 1]
    pub load: f64,
}

struct RegisteredBackend {
    spec: BackendSpec,
    handler: Arc<dyn AnalysisBackend>,
    status: BackendStatus,
    last_health_check: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    in_flight: Arc<AtomicUsize>,
}

impl RegisteredBackend {
    fn snapshot(&self) -> BackendSnapshot {
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        let load = if self.spec.max_concurrent == 0 {
            1.0
        } else {
            in_flight as f64 / self.spec.max_concurrent as f64
        };

        // An available backend with work in flight presents as busy.
        let status = if self.status == BackendStatus::Available
            && in_flight > 0
            && in_flight < self.spec.max_concurrent
        {
            BackendStatus::Busy
        } else {
            self.status
        };

        BackendSnapshot {
            spec: self.spec.clone(),
            status,
            last_health_check: self.last_health_check,
            consecutive_failures: self.consecutive_failures,
            in_flight,
            load,
        }
    }
}

/// Registry of analysis backends
///
/// Reads return cloned snapshots so callers never hold the registry lock
/// while making routing decisions or backend calls.
pub struct BackendRegistry {
    backends: Arc<RwLock<HashMap<String, RegisteredBackend>>>,
    events: broadcast::Sender<StatusChange>,
}

/// Consecutive probe failures before a degraded backend is marked unavailable
const UNAVAILABLE_FAILURE_THRESHOLD: u32 = 3;

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            backends: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Register a backend, replacing any declaration with the same identity
    ///
    /// Runtime state (status, in-flight counter, probe history) survives
    /// re-registration so reconfiguration does not reset health tracking.
    pub async fn register(&self, spec: BackendSpec, handler: Arc<dyn AnalysisBackend>) {
        let mut backends = self.backends.write().await;

        match backends.get_mut(&spec.id) {
            Some(existing) => {
                existing.spec = spec;
                existing.handler = handler;
            }
            None => {
                let status = spec.initial_status;
                backends.insert(
                    spec.id.clone(),
                    RegisteredBackend {
                        spec,
                        handler,
                        status,
                        last_health_check: None,
                        consecutive_failures: 0,
                        in_flight: Arc::new(AtomicUsize::new(0)),
                    },
                );
            }
        }
    }

    /// Remove a backend declaration
    pub async fn deregister(&self, backend_id: &str) -> bool {
        let mut backends = self.backends.write().await;
        backends.remove(backend_id).is_some()
    }

    /// Get a snapshot of one backend
    pub async fn get(&self, backend_id: &str) -> Option<BackendSnapshot> {
        let backends = self.backends.read().await;
        backends.get(backend_id).map(|b| b.snapshot())
    }

    /// Get the call handler for a backend
    pub async fn handler(&self, backend_id: &str) -> Option<Arc<dyn AnalysisBackend>> {
        let backends = self.backends.read().await;
        backends.get(backend_id).map(|b| Arc::clone(&b.handler))
    }

    /// Snapshot of every registered backend
    pub async fn list(&self) -> Vec<BackendSnapshot> {
        let backends = self.backends.read().await;
        backends.values().map(|b| b.snapshot()).collect()
    }

    /// Backends declaring `capability` that are currently available
    pub async fn by_capability(&self, capability: Capability) -> Vec<BackendSnapshot> {
        let backends = self.backends.read().await;
        backends
            .values()
            .map(|b| b.snapshot())
            .filter(|s| {
                s.spec.capabilities.contains(&capability) && s.status == BackendStatus::Available
            })
            .collect()
    }

    /// Backends currently in `status`
    pub async fn by_status(&self, status: BackendStatus) -> Vec<BackendSnapshot> {
        let backends = self.backends.read().await;
        backends
            .values()
            .map(|b| b.snapshot())
            .filter(|s| s.status == status)
            .collect()
    }

    /// Operator-driven status override
    pub async fn set_status(&self, backend_id: &str, status: BackendStatus) -> RegistryResult<()> {
        let mut backends = self.backends.write().await;
        let entry = backends
            .get_mut(backend_id)
            .ok_or_else(|| RegistryError::BackendNotFound(backend_id.to_string()))?;

        let from = entry.status;
        entry.status = status;
        drop(backends);

        self.emit(backend_id, from, status);
        Ok(())
    }

    /// Current load fraction of a backend
    pub async fn load(&self, backend_id: &str) -> Option<f64> {
        self.get(backend_id).await.map(|s| s.load)
    }

    /// Shared in-flight counter for a backend, used by its dispatcher
    pub async fn in_flight_counter(&self, backend_id: &str) -> Option<Arc<AtomicUsize>> {
        let backends = self.backends.read().await;
        backends.get(backend_id).map(|b| Arc::clone(&b.in_flight))
    }

    /// Record a successful health probe
    ///
    /// Recovers degraded, unavailable, and maintenance backends back to
    /// available and resets the failure streak.
    pub async fn record_probe_success(&self, backend_id: &str) {
        let mut backends = self.backends.write().await;
        let Some(entry) = backends.get_mut(backend_id) else {
            return;
        };

        entry.last_health_check = Some(Utc::now());
        entry.consecutive_failures = 0;

        let from = entry.status;
        if matches!(
            from,
            BackendStatus::Degraded | BackendStatus::Unavailable | BackendStatus::Maintenance
        ) {
            entry.status = BackendStatus::Available;
            drop(backends);
            self.emit(backend_id, from, BackendStatus::Available);
        }
    }

    /// Record a failed health probe
    ///
    /// A single failure degrades an available backend; three consecutive
    /// failures mark it unavailable. Maintenance is operator-owned and is
    /// never changed by probes.
    pub async fn record_probe_failure(&self, backend_id: &str) {
        let mut backends = self.backends.write().await;
        let Some(entry) = backends.get_mut(backend_id) else {
            return;
        };

        entry.last_health_check = Some(Utc::now());
        entry.consecutive_failures += 1;

        let from = entry.status;
        let to = match from {
            BackendStatus::Available | BackendStatus::Busy => BackendStatus::Degraded,
            BackendStatus::Degraded
                if entry.consecutive_failures >= UNAVAILABLE_FAILURE_THRESHOLD =>
            {
                BackendStatus::Unavailable
            }
            other => other,
        };

        if to != from {
            entry.status = to;
            drop(backends);
            self.emit(backend_id, from, to);
        }
    }

    /// Subscribe to status-change events
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    fn emit(&self, backend_id: &str, from: BackendStatus, to: BackendStatus) {
        log::info!("backend {} status {:?} -> {:?}", backend_id, from, to);
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.events.send(StatusChange {
            backend_id: backend_id.to_string(),
            from,
            to,
            at: Utc::now(),
        });
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
