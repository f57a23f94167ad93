//! Per-backend priority queues with dispatch, retry, and cancellation
//!
//! This module provides:
//! - One priority queue per backend, strict priority with FIFO ties
//! - In-flight limits equal to each backend's declared concurrency
//! - Non-blocking enqueue with a saturation ceiling
//! - Retry with exponential backoff, up to a job's attempt budget
//! - Cancellation in pending and processing states
//! - Retention sweeps for terminal jobs
//!
//! Each backend's queue state is guarded by its own lock; there is no
//! global queue lock, and no lock is held across a backend call.

pub mod dispatcher;
pub mod job;

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};

use crate::config::ThresholdConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::metrics::MetricsStore;
use crate::registry::{AnalysisOutcome, BackendRegistry};
use crate::request::AnalysisRequest;
use crate::routing::QueueObserver;

pub use job::{CancelToken, Job, JobSlot, JobState};

/// Terminal job event delivered to the facade
pub struct JobCompletion {
    pub job_id: String,
    pub request: AnalysisRequest,
    pub backend_id: String,
    pub outcome: Result<AnalysisOutcome, SchedulerError>,
    pub latency_ms: f64,
}

/// Heap entry; higher priority first, FIFO within equal priority
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingJob {
    pub(crate) priority: u32,
    pub(crate) seq: u64,
    pub(crate) job_id: String,
}

impl Ord for PendingJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub(crate) struct QueueCounters {
    pub enqueued: AtomicU64,
    pub dispatched: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub retried: AtomicU64,
    pub rejected: AtomicU64,
}

/// Point-in-time counters for one backend queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatsSnapshot {
    pub backend_id: String,
    pub pending: usize,
    pub in_flight: usize,
    pub paused: bool,
    pub enqueued: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub rejected: u64,
}

pub(crate) struct BackendQueue {
    pub backend_id: String,
    pending: Mutex<BinaryHeap<PendingJob>>,
    paused: AtomicBool,
    pub notify: Notify,
    pub counters: QueueCounters,
}

impl BackendQueue {
    fn new(backend_id: String) -> Self {
        Self {
            backend_id,
            pending: Mutex::new(BinaryHeap::new()),
            paused: AtomicBool::new(false),
            notify: Notify::new(),
            counters: QueueCounters::default(),
        }
    }

    pub fn push(&self, entry: PendingJob) {
        self.pending.lock().push(entry);
        self.notify.notify_waiters();
    }

    fn remove(&self, job_id: &str) {
        self.pending.lock().retain(|p| p.job_id != job_id);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Pop the highest-priority dispatchable job
    ///
    /// Entries whose jobs were cancelled or swept are discarded; delayed
    /// entries are kept aside and re-pushed so they do not block ready work
    /// behind them.
    pub fn pop_ready(
        &self,
        now: DateTime<Utc>,
        jobs: &DashMap<String, Arc<JobSlot>>,
    ) -> Option<Arc<JobSlot>> {
        let mut pending = self.pending.lock();
        let mut deferred = Vec::new();
        let mut found = None;

        while let Some(top) = pending.pop() {
            let Some(slot) = jobs.get(&top.job_id).map(|s| Arc::clone(s.value())) else {
                continue;
            };

            match slot.state() {
                JobState::Pending | JobState::Retrying => {
                    if slot.job.read().is_ready(now) {
                        found = Some(slot);
                        break;
                    }
                    deferred.push(top);
                }
                _ => {}
            }
        }

        for entry in deferred {
            pending.push(entry);
        }
        found
    }
}

/// Handle data returned from a successful enqueue
pub struct EnqueuedJob {
    pub job_id: String,
    pub state_rx: watch::Receiver<JobState>,
}

/// Owner of every backend queue and job record
pub struct QueueManager {
    queues: DashMap<String, Arc<BackendQueue>>,
    jobs: Arc<DashMap<String, Arc<JobSlot>>>,
    registry: Arc<BackendRegistry>,
    metrics: Arc<MetricsStore>,
    thresholds: ThresholdConfig,
    completions: mpsc::UnboundedSender<JobCompletion>,
    seq: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
}

impl QueueManager {
    /// Create a manager and the completion channel consumed by the facade
    pub fn new(
        registry: Arc<BackendRegistry>,
        metrics: Arc<MetricsStore>,
        thresholds: ThresholdConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<JobCompletion>) {
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let manager = Arc::new(Self {
            queues: DashMap::new(),
            jobs: Arc::new(DashMap::new()),
            registry,
            metrics,
            thresholds,
            completions,
            seq: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
        });

        (manager, completions_rx)
    }

    fn ensure_queue(&self, backend_id: &str) -> Arc<BackendQueue> {
        if let Some(queue) = self.queues.get(backend_id) {
            return Arc::clone(queue.value());
        }

        let queue = Arc::new(BackendQueue::new(backend_id.to_string()));
        let inserted = self
            .queues
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::clone(&queue))
            .clone();

        // First creator spawns the dispatcher for this backend.
        if Arc::ptr_eq(&inserted, &queue) {
            let ctx = dispatcher::DispatcherContext {
                backend_id: backend_id.to_string(),
                queue: Arc::clone(&queue),
                jobs: Arc::clone(&self.jobs),
                registry: Arc::clone(&self.registry),
                metrics: Arc::clone(&self.metrics),
                completions: self.completions.clone(),
                thresholds: self.thresholds.clone(),
                seq: Arc::clone(&self.seq),
            };
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(dispatcher::run(ctx, shutdown_rx));
        }

        inserted
    }

    /// Enqueue a routed request
    ///
    /// Non-blocking; rejects with `backend-saturated` when the backend's
    /// pending ceiling is reached.
    pub async fn enqueue(
        &self,
        request: AnalysisRequest,
        backend_id: &str,
    ) -> SchedulerResult<EnqueuedJob> {
        if *self.shutdown_tx.borrow() {
            return Err(SchedulerError::ShuttingDown);
        }
        if self.registry.get(backend_id).await.is_none() {
            return Err(SchedulerError::NoEligibleBackend(request.id.clone()));
        }

        let queue = self.ensure_queue(backend_id);
        if queue.len() >= self.thresholds.queue_saturation_ceiling {
            queue.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SchedulerError::BackendSaturated {
                backend_id: backend_id.to_string(),
                alternatives: Vec::new(),
            });
        }

        let job = Job::new(
            request,
            backend_id,
            self.thresholds.max_attempts,
            Duration::from_millis(self.thresholds.free_tier_delay_ms),
        );
        let job_id = job.id.clone();
        let priority = job.priority;

        let slot = JobSlot::new(job);
        let state_rx = slot.subscribe();
        self.jobs.insert(job_id.clone(), slot);

        queue.push(PendingJob {
            priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            job_id: job_id.clone(),
        });
        queue.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        Ok(EnqueuedJob { job_id, state_rx })
    }

    /// Cancel a job
    ///
    /// Pending jobs are removed silently; processing jobs have their
    /// in-flight call signalled. Terminal jobs ignore cancellation and
    /// return false.
    pub fn cancel(&self, job_id: &str) -> bool {
        let Some(slot) = self.jobs.get(job_id).map(|s| Arc::clone(s.value())) else {
            return false;
        };

        match slot.state() {
            JobState::Pending | JobState::Retrying => {
                // Signal the token too, in case a dispatcher pops this job
                // concurrently with the state change.
                slot.cancel.cancel();
                if !slot.set_state(JobState::Cancelled) {
                    return false;
                }

                let (backend_id, request) = {
                    let job = slot.job.read();
                    (job.backend_id.clone(), job.request.clone())
                };
                if let Some(queue) = self.queues.get(&backend_id) {
                    queue.remove(job_id);
                    queue.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                }

                let _ = self.completions.send(JobCompletion {
                    job_id: job_id.to_string(),
                    request,
                    backend_id,
                    outcome: Err(SchedulerError::Cancelled),
                    latency_ms: 0.0,
                });
                true
            }
            JobState::Processing => slot.cancel.cancel(),
            _ => false,
        }
    }

    /// Current job record, including terminal jobs inside their retention
    /// window
    pub fn status(&self, job_id: &str) -> Option<Job> {
        self.jobs.get(job_id).map(|slot| slot.job.read().clone())
    }

    /// Subscribe to a job's state transitions
    pub fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<JobState>> {
        self.jobs.get(job_id).map(|slot| slot.subscribe())
    }

    /// Terminal outcome of a job, `None` while it is still live
    pub fn outcome(&self, job_id: &str) -> Option<SchedulerResult<AnalysisOutcome>> {
        let slot = self.jobs.get(job_id).map(|s| Arc::clone(s.value()))?;
        let job = slot.job.read();

        match job.state {
            JobState::Completed => Some(Ok(job
                .result
                .clone()
                .unwrap_or_else(|| AnalysisOutcome::from_artifact(serde_json::Value::Null)))),
            JobState::Failed => {
                let error = slot.final_error.lock().clone().unwrap_or_else(|| {
                    SchedulerError::BackendFatal(
                        job.error.clone().unwrap_or_else(|| "unknown failure".to_string()),
                    )
                });
                Some(Err(error))
            }
            JobState::Cancelled => Some(Err(SchedulerError::Cancelled)),
            _ => None,
        }
    }

    /// Per-backend queue counters
    pub async fn stats(&self) -> Vec<QueueStatsSnapshot> {
        let queues: Vec<Arc<BackendQueue>> = self
            .queues
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut out = Vec::with_capacity(queues.len());
        for queue in queues {
            let in_flight = self
                .registry
                .get(&queue.backend_id)
                .await
                .map(|s| s.in_flight)
                .unwrap_or(0);

            out.push(QueueStatsSnapshot {
                backend_id: queue.backend_id.clone(),
                pending: queue.len(),
                in_flight,
                paused: queue.is_paused(),
                enqueued: queue.counters.enqueued.load(Ordering::Relaxed),
                dispatched: queue.counters.dispatched.load(Ordering::Relaxed),
                completed: queue.counters.completed.load(Ordering::Relaxed),
                failed: queue.counters.failed.load(Ordering::Relaxed),
                cancelled: queue.counters.cancelled.load(Ordering::Relaxed),
                retried: queue.counters.retried.load(Ordering::Relaxed),
                rejected: queue.counters.rejected.load(Ordering::Relaxed),
            });
        }

        out.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        out
    }

    /// Stop dispatching for a backend; queued jobs wait
    pub fn pause(&self, backend_id: &str) {
        let queue = self.ensure_queue(backend_id);
        queue.paused.store(true, Ordering::SeqCst);
    }

    /// Resume dispatching for a backend
    pub fn resume(&self, backend_id: &str) {
        let queue = self.ensure_queue(backend_id);
        queue.paused.store(false, Ordering::SeqCst);
        queue.notify.notify_waiters();
    }

    /// Drop terminal jobs past their retention window or per-backend cap
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let completed_window = chrono::Duration::seconds(self.thresholds.completed_retention_secs as i64);
        let failed_window = chrono::Duration::seconds(self.thresholds.failed_retention_secs as i64);

        let mut removable = Vec::new();
        // (backend, is_completed) -> [(completed_at, job_id)]
        let mut survivors: std::collections::HashMap<(String, bool), Vec<(DateTime<Utc>, String)>> =
            std::collections::HashMap::new();

        for entry in self.jobs.iter() {
            let job = entry.value().job.read();
            if !job.state.is_terminal() {
                continue;
            }
            let completed_at = job.completed_at.unwrap_or(job.created_at);
            let is_completed = job.state == JobState::Completed;
            let window = if is_completed { completed_window } else { failed_window };

            if completed_at + window <= now {
                removable.push(job.id.clone());
            } else {
                survivors
                    .entry((job.backend_id.clone(), is_completed))
                    .or_default()
                    .push((completed_at, job.id.clone()));
            }
        }

        // Enforce per-backend caps, newest jobs survive.
        for ((_, is_completed), mut jobs) in survivors {
            let cap = if is_completed {
                self.thresholds.completed_retention_max
            } else {
                self.thresholds.failed_retention_max
            };
            if jobs.len() > cap {
                jobs.sort_by(|a, b| b.0.cmp(&a.0));
                removable.extend(jobs.into_iter().skip(cap).map(|(_, id)| id));
            }
        }

        let removed = removable.len();
        for job_id in removable {
            self.jobs.remove(&job_id);
        }
        removed
    }

    /// Signal dispatchers to stop and cancel all live jobs
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let live: Vec<String> = self
            .jobs
            .iter()
            .filter(|e| !e.value().state().is_terminal())
            .map(|e| e.key().clone())
            .collect();

        for job_id in live {
            self.cancel(&job_id);
        }

        for queue in self.queues.iter() {
            queue.notify.notify_waiters();
        }
    }
}

impl QueueObserver for QueueManager {
    fn pending_count(&self, backend_id: &str) -> usize {
        self.queues
            .get(backend_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}
