//! Rolling per-backend metrics
//!
//! This module provides:
//! - Atomic request/success/failure counters per backend
//! - Exponential-moving-average latency with a fixed smoothing factor
//! - Latency percentiles over a bounded ring of recent samples
//! - Hourly roll-up buckets retained for the last 24 hours
//!
//! Recording never blocks the caller beyond a short critical section around
//! the sample ring; readers observe a recent snapshot rather than a
//! linearizable view.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::Clock;

/// EMA smoothing factor for latency
const EMA_ALPHA: f64 = 0.1;

/// Default bounded sample count for percentile computation
const DEFAULT_SAMPLE_CAPACITY: usize = 1000;

/// Hourly buckets retained per backend
const HOURLY_RETENTION: usize = 24;

/// One closed hourly roll-up bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyRollup {
    /// Epoch second of the top of the hour
    pub hour_epoch: i64,
    pub count: u64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, Default)]
struct HourAccumulator {
    hour_epoch: i64,
    count: u64,
    failures: u64,
    latency_sum_ms: f64,
    cost: f64,
}

impl HourAccumulator {
    fn close(&self) -> HourlyRollup {
        let avg = if self.count > 0 {
            self.latency_sum_ms / self.count as f64
        } else {
            0.0
        };
        let error_rate = if self.count > 0 {
            self.failures as f64 / self.count as f64
        } else {
            0.0
        };

        HourlyRollup {
            hour_epoch: self.hour_epoch,
            count: self.count,
            avg_latency_ms: avg,
            error_rate,
            cost: self.cost,
        }
    }
}

/// Point-in-time view of one backend's metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendMetricsSnapshot {
    pub backend_id: String,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// successes / total; 1.0 when no requests were recorded yet
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub total_cost: f64,
}

struct BackendMetricsInner {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    // EMA, total cost, sample ring, and the open hourly bucket share one
    // short critical section per update.
    window: Mutex<MetricsWindow>,
    hourly: Mutex<VecDeque<HourlyRollup>>,
}

struct MetricsWindow {
    ema_latency_ms: Option<f64>,
    total_cost: f64,
    samples: VecDeque<f64>,
    current_hour: HourAccumulator,
}

impl BackendMetricsInner {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            window: Mutex::new(MetricsWindow {
                ema_latency_ms: None,
                total_cost: 0.0,
                samples: VecDeque::with_capacity(DEFAULT_SAMPLE_CAPACITY),
                current_hour: HourAccumulator {
                    hour_epoch: Clock::hour_epoch(now),
                    ..Default::default()
                },
            }),
            hourly: Mutex::new(VecDeque::with_capacity(HOURLY_RETENTION)),
        }
    }
}

/// Per-backend metrics store
pub struct MetricsStore {
    backends: DashMap<String, Arc<BackendMetricsInner>>,
    sample_capacity: usize,
}

impl MetricsStore {
    /// Create a store with the default percentile sample capacity
    pub fn new() -> Self {
        Self::with_sample_capacity(DEFAULT_SAMPLE_CAPACITY)
    }

    /// Create a store retaining up to `capacity` recent latency samples
    pub fn with_sample_capacity(capacity: usize) -> Self {
        Self {
            backends: DashMap::new(),
            sample_capacity: capacity.max(1),
        }
    }

    fn entry(&self, backend_id: &str) -> Arc<BackendMetricsInner> {
        self.backends
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(BackendMetricsInner::new(Utc::now())))
            .clone()
    }

    /// Record one completed attempt
    pub fn record(&self, backend_id: &str, latency_ms: f64, success: bool, cost: f64) {
        let inner = self.entry(backend_id);

        inner.total.fetch_add(1, Ordering::Relaxed);
        if success {
            inner.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.failures.fetch_add(1, Ordering::Relaxed);
        }

        let now = Utc::now();
        let hour = Clock::hour_epoch(now);

        let mut window = inner.window.lock();

        window.ema_latency_ms = Some(match window.ema_latency_ms {
            Some(ema) => EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * ema,
            None => latency_ms,
        });
        window.total_cost += cost;

        if window.samples.len() >= self.sample_capacity {
            window.samples.pop_front();
        }
        window.samples.push_back(latency_ms);

        // A recording that lands after the hour boundary closes the open
        // bucket even if the maintenance loop has not run yet.
        if window.current_hour.hour_epoch != hour {
            let closed = window.current_hour.close();
            window.current_hour = HourAccumulator {
                hour_epoch: hour,
                ..Default::default()
            };
            drop(window);
            Self::push_rollup(&inner, closed);
            window = inner.window.lock();
        }

        window.current_hour.count += 1;
        if !success {
            window.current_hour.failures += 1;
        }
        window.current_hour.latency_sum_ms += latency_ms;
        window.current_hour.cost += cost;
    }

    fn push_rollup(inner: &BackendMetricsInner, rollup: HourlyRollup) {
        let mut hourly = inner.hourly.lock();
        hourly.push_back(rollup);
        while hourly.len() > HOURLY_RETENTION {
            hourly.pop_front();
        }
    }

    /// Snapshot of one backend's metrics
    ///
    /// A backend with no recorded traffic reports a success rate of 1.0 so
    /// the router does not penalize fresh backends.
    pub fn snapshot(&self, backend_id: &str) -> BackendMetricsSnapshot {
        let Some(inner) = self.backends.get(backend_id).map(|e| e.clone()) else {
            return BackendMetricsSnapshot {
                backend_id: backend_id.to_string(),
                total_requests: 0,
                successes: 0,
                failures: 0,
                success_rate: 1.0,
                avg_latency_ms: 0.0,
                p50_latency_ms: 0.0,
                p95_latency_ms: 0.0,
                p99_latency_ms: 0.0,
                total_cost: 0.0,
            };
        };

        let total = inner.total.load(Ordering::Relaxed);
        let successes = inner.successes.load(Ordering::Relaxed);
        let failures = inner.failures.load(Ordering::Relaxed);
        let success_rate = if total > 0 {
            successes as f64 / total as f64
        } else {
            1.0
        };

        let window = inner.window.lock();
        let percentiles = compute_percentiles(&window.samples, &[0.50, 0.95, 0.99]);

        BackendMetricsSnapshot {
            backend_id: backend_id.to_string(),
            total_requests: total,
            successes,
            failures,
            success_rate,
            avg_latency_ms: window.ema_latency_ms.unwrap_or(0.0),
            p50_latency_ms: percentiles[0],
            p95_latency_ms: percentiles[1],
            p99_latency_ms: percentiles[2],
            total_cost: window.total_cost,
        }
    }

    /// Arbitrary percentile values over the recent sample ring
    pub fn percentiles(&self, backend_id: &str, quantiles: &[f64]) -> Vec<f64> {
        match self.backends.get(backend_id) {
            Some(inner) => {
                let window = inner.window.lock();
                compute_percentiles(&window.samples, quantiles)
            }
            None => vec![0.0; quantiles.len()],
        }
    }

    /// Closed hourly roll-up buckets, oldest first
    pub fn hourly(&self, backend_id: &str) -> Vec<HourlyRollup> {
        match self.backends.get(backend_id) {
            Some(inner) => inner.hourly.lock().iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Close any hourly bucket whose hour has passed
    ///
    /// Called by the maintenance loop so idle backends still roll over.
    pub fn rollup_check(&self, now: DateTime<Utc>) -> Vec<(String, HourlyRollup)> {
        let hour = Clock::hour_epoch(now);
        let mut closed = Vec::new();

        for entry in self.backends.iter() {
            let inner = entry.value().clone();
            let mut window = inner.window.lock();
            if window.current_hour.hour_epoch != hour {
                let rollup = window.current_hour.close();
                window.current_hour = HourAccumulator {
                    hour_epoch: hour,
                    ..Default::default()
                };
                drop(window);
                if rollup.count > 0 {
                    Self::push_rollup(&inner, rollup.clone());
                    closed.push((entry.key().clone(), rollup));
                }
            }
        }

        closed
    }

    /// Backend ids with recorded metrics
    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn compute_percentiles(samples: &VecDeque<f64>, quantiles: &[f64]) -> Vec<f64> {
    if samples.is_empty() {
        return vec![0.0; quantiles.len()];
    }

    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    quantiles
        .iter()
        .map(|q| {
            let q = q.clamp(0.0, 1.0);
            let rank = (q * sorted.len() as f64).ceil() as usize;
            sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot_defaults() {
        let store = MetricsStore::new();
        let snap = store.snapshot("missing");
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.success_rate, 1.0);
        assert_eq!(snap.avg_latency_ms, 0.0);
    }

    #[test]
    fn test_counters_and_success_rate() {
        let store = MetricsStore::new();
        store.record("b1", 100.0, true, 0.01);
        store.record("b1", 200.0, true, 0.01);
        store.record("b1", 300.0, false, 0.01);

        let snap = store.snapshot("b1");
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.successes, 2);
        assert_eq!(snap.failures, 1);
        assert!((snap.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((snap.total_cost - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_ema_smoothing() {
        let store = MetricsStore::new();
        store.record("b1", 100.0, true, 0.0);
        store.record("b1", 200.0, true, 0.0);

        let snap = store.snapshot("b1");
        // 0.1 * 200 + 0.9 * 100
        assert!((snap.avg_latency_ms - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentiles_over_samples() {
        let store = MetricsStore::new();
        for i in 1..=100 {
            store.record("b1", i as f64, true, 0.0);
        }

        let ps = store.percentiles("b1", &[0.5, 0.95, 0.99]);
        assert_eq!(ps[0], 50.0);
        assert_eq!(ps[1], 95.0);
        assert_eq!(ps[2], 99.0);
    }

    #[test]
    fn test_sample_ring_is_bounded() {
        let store = MetricsStore::with_sample_capacity(10);
        for i in 0..50 {
            store.record("b1", i as f64, true, 0.0);
        }

        // Only the last 10 samples (40..49) remain.
        let ps = store.percentiles("b1", &[0.0, 1.0]);
        assert_eq!(ps[0], 40.0);
        assert_eq!(ps[1], 49.0);
    }

    #[test]
    fn test_rollup_check_closes_stale_hours() {
        let store = MetricsStore::new();
        store.record("b1", 120.0, true, 0.02);
        store.record("b1", 240.0, false, 0.02);

        let next_hour = Utc::now() + chrono::Duration::hours(1);
        let closed = store.rollup_check(next_hour);

        assert_eq!(closed.len(), 1);
        let (id, rollup) = &closed[0];
        assert_eq!(id, "b1");
        assert_eq!(rollup.count, 2);
        assert!((rollup.avg_latency_ms - 180.0).abs() < 1e-9);
        assert!((rollup.error_rate - 0.5).abs() < 1e-9);

        assert_eq!(store.hourly("b1").len(), 1);
    }
}
