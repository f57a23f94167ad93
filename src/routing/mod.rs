//! Cost- and capability-aware backend routing
//!
//! This module provides:
//! - Capability filtering per the backend-eligibility invariant
//! - A short-circuiting rule cascade for well-known request shapes
//! - A capped, weighted composite score for everything else
//! - Latency, cost, and queue-position estimates on every decision
//!
//! The cascade falls through rule by rule when a rule matches the request
//! shape but finds no usable backend, and lands on the composite score last.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ThresholdConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::metrics::MetricsStore;
use crate::registry::{BackendKind, BackendRegistry, BackendSnapshot, BackendStatus};
use crate::request::{AnalysisRequest, Complexity, PrincipalTier, RequestKind, RequestPriority};

/// Baseline latency against which backends are scored
const LATENCY_BASELINE_MS: f64 = 120_000.0;

/// Alternatives carried on a decision
const MAX_ALTERNATIVES: usize = 5;

/// Pending-queue depths consulted for estimates
///
/// Implemented by the queue manager; the router only ever reads.
pub trait QueueObserver: Send + Sync {
    /// Pending jobs for a backend
    fn pending_count(&self, backend_id: &str) -> usize;
}

/// An observer reporting empty queues, used before queues exist
pub struct NoQueues;

impl QueueObserver for NoQueues {
    fn pending_count(&self, _backend_id: &str) -> usize {
        0
    }
}

/// The outcome of routing one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_id: String,
    pub backend_id: String,
    /// Runner-up backends, best first
    pub alternatives: Vec<String>,
    pub reason: String,
    pub estimated_latency_ms: u64,
    pub estimated_cost: f64,
    pub estimated_queue_position: usize,
    pub cache_hit: bool,
    pub decided_at: DateTime<Utc>,
}

impl RoutingDecision {
    /// Decision synthesized for a cache hit; no backend will be called
    pub fn cache_hit(request_id: impl Into<String>, backend_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            backend_id: backend_id.into(),
            alternatives: Vec::new(),
            reason: "cache-hit".to_string(),
            estimated_latency_ms: 0,
            estimated_cost: 0.0,
            estimated_queue_position: 0,
            cache_hit: true,
            decided_at: Utc::now(),
        }
    }
}

/// The routing policy
pub struct Router {
    registry: Arc<BackendRegistry>,
    metrics: Arc<MetricsStore>,
    queues: Arc<dyn QueueObserver>,
    thresholds: ThresholdConfig,
}

impl Router {
    /// Create a router over the given registry and metrics
    pub fn new(
        registry: Arc<BackendRegistry>,
        metrics: Arc<MetricsStore>,
        queues: Arc<dyn QueueObserver>,
        thresholds: ThresholdConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            queues,
            thresholds,
        }
    }

    /// Pick a backend for a request
    pub async fn route(&self, request: &AnalysisRequest) -> SchedulerResult<RoutingDecision> {
        let snapshots = self.registry.list().await;

        let mut candidates: Vec<BackendSnapshot> = snapshots
            .iter()
            .filter(|s| {
                s.status.is_routable()
                    && request.required_capabilities.is_subset(&s.spec.capabilities)
            })
            .cloned()
            .collect();

        let mut fallback = false;
        if candidates.is_empty() {
            candidates = self.closest_matches(&snapshots, &request.required_capabilities);
            fallback = true;
        }
        if candidates.is_empty() {
            return Err(SchedulerError::NoEligibleBackend(request.id.clone()));
        }

        let (selected, reason) = self.cascade(request, &candidates);
        let reason = if fallback {
            format!("capability-fallback:{}", reason)
        } else {
            reason
        };

        let mut ranked = self.rank_by_score(request, &candidates);
        ranked.retain(|id| *id != selected.spec.id);
        ranked.truncate(MAX_ALTERNATIVES);

        Ok(self.decide(request, &selected, ranked, reason))
    }

    /// Backends sharing the most required capabilities, used when no full
    /// superset match exists
    fn closest_matches(
        &self,
        snapshots: &[BackendSnapshot],
        required: &HashSet<crate::request::Capability>,
    ) -> Vec<BackendSnapshot> {
        let overlap = |s: &BackendSnapshot| -> usize {
            required.intersection(&s.spec.capabilities).count()
        };

        let best = snapshots
            .iter()
            .filter(|s| s.status.is_routable())
            .map(overlap)
            .max()
            .unwrap_or(0);
        if best == 0 {
            return Vec::new();
        }

        snapshots
            .iter()
            .filter(|s| s.status.is_routable() && overlap(s) == best)
            .cloned()
            .collect()
    }

    fn cascade<'a>(
        &self,
        request: &AnalysisRequest,
        candidates: &'a [BackendSnapshot],
    ) -> (&'a BackendSnapshot, String) {
        // Rule 1: urgent, simple work goes to the fastest lightly loaded backend.
        if request.priority == RequestPriority::Urgent && request.complexity == Complexity::Simple {
            if let Some(found) = candidates
                .iter()
                .filter(|s| self.is_serving(s) && s.load < self.thresholds.available_load)
                .min_by(|a, b| {
                    a.spec
                        .avg_latency_ms
                        .cmp(&b.spec.avg_latency_ms)
                        .then_with(|| a.spec.id.cmp(&b.spec.id))
                })
            {
                return (found, "urgent-fast-path".to_string());
            }
        }

        // Rule 2: heavy, non-urgent work prefers dedicated complex backends,
        // then backups.
        if request.complexity.is_heavy() && request.priority != RequestPriority::Urgent {
            for kind in [BackendKind::Complex, BackendKind::Backup] {
                if let Some(found) = candidates
                    .iter()
                    .filter(|s| s.spec.kind == kind && self.is_serving(s))
                    .max_by(|a, b| {
                        a.spec
                            .base_priority
                            .cmp(&b.spec.base_priority)
                            .then_with(|| b.spec.id.cmp(&a.spec.id))
                    })
                {
                    return (found, "complexity-dedicated".to_string());
                }
            }
        }

        // Rule 3: business queries go to business-tagged backends.
        if request.kind == RequestKind::BusinessQuery {
            if let Some(found) = candidates
                .iter()
                .filter(|s| s.spec.has_business_tag() && self.is_serving(s))
                .max_by(|a, b| {
                    a.spec
                        .base_priority
                        .cmp(&b.spec.base_priority)
                        .then_with(|| b.spec.id.cmp(&a.spec.id))
                })
            {
                return (found, "business-tag".to_string());
            }
        }

        // Rule 4: free tier picks the cheapest backend with headroom.
        if request.tier == PrincipalTier::Free {
            if let Some(found) = candidates
                .iter()
                .filter(|s| s.load < self.thresholds.free_tier_load)
                .min_by(|a, b| {
                    a.spec
                        .cost_per_request
                        .partial_cmp(&b.spec.cost_per_request)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.spec.id.cmp(&b.spec.id))
                })
            {
                return (found, "free-tier-cost".to_string());
            }
        }

        // Rule 5: paying tiers pick the lowest declared latency.
        if matches!(request.tier, PrincipalTier::Premium | PrincipalTier::Enterprise) {
            if let Some(found) = candidates
                .iter()
                .filter(|s| self.is_serving(s))
                .min_by(|a, b| {
                    a.spec
                        .avg_latency_ms
                        .cmp(&b.spec.avg_latency_ms)
                        .then_with(|| a.spec.id.cmp(&b.spec.id))
                })
            {
                return (found, "paid-tier-latency".to_string());
            }
        }

        // Rule 6: composite score over everything still standing. The caller
        // guarantees candidates is non-empty.
        let best = candidates
            .iter()
            .max_by(|a, b| {
                let sa = self.composite_score(request, a);
                let sb = self.composite_score(request, b);
                sa.partial_cmp(&sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        b.spec
                            .cost_per_request
                            .partial_cmp(&a.spec.cost_per_request)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| b.spec.id.cmp(&a.spec.id))
            })
            .unwrap_or(&candidates[0]);

        (best, "composite-score".to_string())
    }

    fn is_serving(&self, snapshot: &BackendSnapshot) -> bool {
        matches!(snapshot.status, BackendStatus::Available | BackendStatus::Busy)
    }

    /// Weighted composite score with capped components
    fn composite_score(&self, request: &AnalysisRequest, snapshot: &BackendSnapshot) -> f64 {
        let spec = &snapshot.spec;
        let metrics = self.metrics.snapshot(&spec.id);

        let priority_score = (f64::from(spec.base_priority) * 3.0).min(30.0);
        let success_score = metrics.success_rate * 20.0;
        let cost_score = if spec.cost_per_request > 0.0 {
            ((1.0 / spec.cost_per_request) * 2.0).min(20.0)
        } else {
            20.0
        };
        let latency_score = if spec.avg_latency_ms > 0 {
            ((LATENCY_BASELINE_MS / spec.avg_latency_ms as f64) * 10.0).min(20.0)
        } else {
            20.0
        };
        let load_score = (1.0 - snapshot.load).max(0.0) * 10.0;
        let tier_bonus = request.tier.score_bonus();
        let capability_score = if spec.capabilities.is_empty() {
            0.0
        } else {
            request
                .required_capabilities
                .intersection(&spec.capabilities)
                .count() as f64
                / spec.capabilities.len() as f64
                * 10.0
        };

        priority_score
            + success_score
            + cost_score
            + latency_score
            + load_score
            + tier_bonus
            + capability_score
    }

    fn rank_by_score(&self, request: &AnalysisRequest, candidates: &[BackendSnapshot]) -> Vec<String> {
        let mut scored: Vec<(&BackendSnapshot, f64)> = candidates
            .iter()
            .map(|s| (s, self.composite_score(request, s)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.0.spec
                        .cost_per_request
                        .partial_cmp(&b.0.spec.cost_per_request)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.0.spec.id.cmp(&b.0.spec.id))
        });

        scored.into_iter().map(|(s, _)| s.spec.id.clone()).collect()
    }

    fn decide(
        &self,
        request: &AnalysisRequest,
        selected: &BackendSnapshot,
        alternatives: Vec<String>,
        reason: String,
    ) -> RoutingDecision {
        let spec = &selected.spec;
        let queue_position = self.queues.pending_count(&spec.id);

        let base_latency = spec.avg_latency_ms as f64;
        let queue_penalty = if spec.max_concurrent > 0 {
            (queue_position as f64 / spec.max_concurrent as f64) * base_latency
        } else {
            0.0
        };
        let estimated_latency_ms =
            (base_latency * request.complexity.latency_multiplier() + queue_penalty) as u64;

        let estimated_cost =
            spec.cost_per_request * request.complexity.cost_multiplier() * request.tier.discount();

        RoutingDecision {
            request_id: request.id.clone(),
            backend_id: spec.id.clone(),
            alternatives,
            reason,
            estimated_latency_ms,
            estimated_cost,
            estimated_queue_position: queue_position,
            cache_hit: false,
            decided_at: Utc::now(),
        }
    }
}
