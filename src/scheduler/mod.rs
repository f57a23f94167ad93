//! Scheduler facade: the single entry point for submissions
//!
//! This module provides:
//! - `submit`: fingerprint → cache lookup (exact, then semantic) → route →
//!   enqueue, returning a [`JobHandle`]
//! - Completion observation by polling or by awaiting the handle
//! - The feedback loop storing successful results into the cache and
//!   persisting job summaries and routing decisions best-effort
//! - Ordered startup and shutdown of every subsystem
//!
//! Dependencies flow one way: the facade holds the registry, metrics,
//! cache, router, and queues; none of them call back into the facade.
//! Completions arrive over a one-way channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::cache::shared::keys;
use crate::cache::{
    CacheEntry, CacheStats, CacheValue, InMemoryArchiveStore, InMemorySharedStore,
    RedisSharedStore, SemanticQuery, SharedStore, SledArchiveStore, TieredCache,
};
use crate::config::FinelensConfig;
use crate::core::{fingerprint, ids};
use crate::error::{SchedulerError, SchedulerResult};
use crate::maintenance::MaintenanceLoop;
use crate::metrics::{BackendMetricsSnapshot, MetricsStore};
use crate::queue::{Job, JobCompletion, JobState, QueueManager, QueueStatsSnapshot};
use crate::registry::{AnalysisBackend, AnalysisOutcome, BackendRegistry, HttpAnalysisBackend};
use crate::request::AnalysisRequest;
use crate::routing::{Router, RoutingDecision};

/// Result of awaiting a handle with a timeout
pub enum AwaitOutcome {
    /// The job reached a terminal state
    Ready(SchedulerResult<AnalysisOutcome>),
    /// Still running when the wait timed out
    Pending,
}

/// Observed state of a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub state: JobState,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<AnalysisOutcome>,
    pub error: Option<String>,
    pub decision: RoutingDecision,
}

/// Opaque handle identifying a pending or completed submission
pub struct JobHandle {
    job_id: String,
    decision: RoutingDecision,
    resolved: Option<AnalysisOutcome>,
    state_rx: Option<watch::Receiver<JobState>>,
    queue: Arc<QueueManager>,
}

impl JobHandle {
    fn resolved(decision: RoutingDecision, outcome: AnalysisOutcome, queue: Arc<QueueManager>) -> Self {
        Self {
            job_id: ids::job_id(),
            decision,
            resolved: Some(outcome),
            state_rx: None,
            queue,
        }
    }

    fn queued(
        job_id: String,
        decision: RoutingDecision,
        state_rx: watch::Receiver<JobState>,
        queue: Arc<QueueManager>,
    ) -> Self {
        Self {
            job_id,
            decision,
            resolved: None,
            state_rx: Some(state_rx),
            queue,
        }
    }

    /// Job identifier
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The routing decision behind this submission
    pub fn decision(&self) -> &RoutingDecision {
        &self.decision
    }

    /// Whether the submission was served from cache
    pub fn cache_hit(&self) -> bool {
        self.decision.cache_hit
    }

    /// Await the terminal outcome, optionally bounded by a timeout
    pub async fn wait(&mut self, timeout: Option<Duration>) -> AwaitOutcome {
        if let Some(result) = &self.resolved {
            return AwaitOutcome::Ready(Ok(result.clone()));
        }

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if let Some(outcome) = self.queue.outcome(&self.job_id) {
                return AwaitOutcome::Ready(outcome);
            }

            let Some(rx) = self.state_rx.as_mut() else {
                return AwaitOutcome::Ready(Err(SchedulerError::JobNotFound(self.job_id.clone())));
            };

            let changed = match deadline {
                Some(at) => match tokio::time::timeout_at(at, rx.changed()).await {
                    Ok(changed) => changed,
                    Err(_) => return AwaitOutcome::Pending,
                },
                None => rx.changed().await,
            };

            if changed.is_err() {
                // Sender gone; the job record is the remaining truth.
                return match self.queue.outcome(&self.job_id) {
                    Some(outcome) => AwaitOutcome::Ready(outcome),
                    None => {
                        AwaitOutcome::Ready(Err(SchedulerError::JobNotFound(self.job_id.clone())))
                    }
                };
            }
        }
    }

    /// Current status report
    pub fn status(&self) -> JobStatusReport {
        if let Some(result) = &self.resolved {
            return JobStatusReport {
                job_id: self.job_id.clone(),
                state: JobState::Completed,
                attempts: 0,
                started_at: None,
                completed_at: Some(self.decision.decided_at),
                result: Some(result.clone()),
                error: None,
                decision: self.decision.clone(),
            };
        }

        match self.queue.status(&self.job_id) {
            Some(job) => JobStatusReport {
                job_id: job.id,
                state: job.state,
                attempts: job.attempts,
                started_at: job.started_at,
                completed_at: job.completed_at,
                result: job.result,
                error: job.error,
                decision: self.decision.clone(),
            },
            None => JobStatusReport {
                job_id: self.job_id.clone(),
                state: JobState::Failed,
                attempts: 0,
                started_at: None,
                completed_at: None,
                result: None,
                error: Some("job record expired".to_string()),
                decision: self.decision.clone(),
            },
        }
    }

    /// Cancel the underlying job
    ///
    /// A handle resolved from cache has nothing to cancel and returns false.
    pub fn cancel(&self) -> bool {
        if self.resolved.is_some() {
            return false;
        }
        self.queue.cancel(&self.job_id)
    }
}

/// The scheduling facade
pub struct Scheduler {
    config: FinelensConfig,
    registry: Arc<BackendRegistry>,
    metrics: Arc<MetricsStore>,
    cache: Arc<TieredCache>,
    router: Router,
    queue: Arc<QueueManager>,
    shared: Arc<dyn SharedStore>,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Bring the service up
    ///
    /// Initialization order is registry → metrics → cache → queues →
    /// facade → maintenance loop. Backends without an explicit handler get
    /// an HTTP handler built from their declared endpoint.
    pub async fn start(
        config: FinelensConfig,
        mut handlers: HashMap<String, Arc<dyn AnalysisBackend>>,
    ) -> SchedulerResult<Arc<Self>> {
        let registry = Arc::new(BackendRegistry::new());
        for spec in &config.backends {
            let handler = handlers.remove(&spec.id).unwrap_or_else(|| {
                Arc::new(HttpAnalysisBackend::new(
                    spec.endpoint.clone(),
                    Duration::from_secs(spec.timeout_seconds),
                ))
            });
            registry.register(spec.clone(), handler).await;
        }

        let metrics = Arc::new(MetricsStore::new());

        let shared: Arc<dyn SharedStore> = match &config.redis_url {
            Some(url) => match RedisSharedStore::connect(url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    log::warn!("shared store unreachable ({}), using in-process store", e);
                    Arc::new(InMemorySharedStore::new())
                }
            },
            None => Arc::new(InMemorySharedStore::new()),
        };

        let archive: Arc<dyn crate::cache::ArchiveStore> = match &config.archive_path {
            Some(path) => match SledArchiveStore::open(path, &config.cache.archive.bucket) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    log::warn!("archive store unavailable ({}), using in-process store", e);
                    Arc::new(InMemoryArchiveStore::new())
                }
            },
            None => Arc::new(InMemoryArchiveStore::new()),
        };

        let cache = Arc::new(TieredCache::new(
            config.cache.clone(),
            config.eviction.clone(),
            Some(Arc::clone(&shared)),
            Some(archive),
            None,
        ));

        let (queue, completions_rx) = QueueManager::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            config.thresholds.clone(),
        );

        let router = Router::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            Arc::clone(&queue) as Arc<dyn crate::routing::QueueObserver>,
            config.thresholds.clone(),
        );

        let (shutdown_tx, _) = watch::channel(false);

        let scheduler = Arc::new(Self {
            config,
            registry,
            metrics,
            cache,
            router,
            queue,
            shared,
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        scheduler.persist_registry().await;

        let completion_task = tokio::spawn(Self::completion_loop(
            Arc::clone(&scheduler),
            completions_rx,
        ));

        let maintenance = MaintenanceLoop::new(
            Arc::clone(&scheduler.registry),
            Arc::clone(&scheduler.metrics),
            Arc::clone(&scheduler.cache),
            Arc::clone(&scheduler.queue),
            Some(Arc::clone(&scheduler.shared)),
            scheduler.config.maintenance.clone(),
        );
        let maintenance_task = maintenance.spawn(scheduler.shutdown_tx.subscribe());

        scheduler
            .tasks
            .lock()
            .extend([completion_task, maintenance_task]);

        Ok(scheduler)
    }

    /// Submit a request
    ///
    /// Non-blocking: returns a handle immediately. Cache hits come back
    /// already resolved with `decision.cache_hit` set and no backend work.
    pub async fn submit(&self, mut request: AnalysisRequest) -> SchedulerResult<JobHandle> {
        if *self.shutdown_tx.borrow() {
            return Err(SchedulerError::ShuttingDown);
        }

        if request.id.is_empty() {
            request.id = ids::request_id();
        }
        if let Some(embedding) = &request.embedding {
            let dims = self.config.cache.similarity.dimensions;
            if embedding.len() != dims {
                return Err(SchedulerError::InvalidArgument(format!(
                    "embedding must have {} dimensions, got {}",
                    dims,
                    embedding.len()
                )));
            }
        }
        if let Some(deadline) = request.deadline {
            if deadline <= Utc::now() {
                return Err(SchedulerError::InvalidArgument(
                    "deadline already passed".to_string(),
                ));
            }
        }

        let key = request.fingerprint.clone().unwrap_or_else(|| {
            fingerprint::request_fingerprint(&request.payload, &request.required_capabilities)
        });
        request.fingerprint = Some(key.clone());

        // Zero-norm embeddings fall back to exact match only.
        let semantic = request
            .embedding
            .as_ref()
            .map(|embedding| SemanticQuery {
                embedding: embedding.clone(),
                threshold: self.config.cache.similarity.threshold,
                capabilities: request.required_capabilities.clone(),
                document_type: request.document_type.clone(),
            })
            .filter(SemanticQuery::has_signal);

        if let Some(entry) = self
            .cache
            .lookup(&key, &request.required_capabilities, semantic.as_ref())
            .await
        {
            log::debug!("request {} served from cache tier {:?}", request.id, entry.tier);
            let decision = RoutingDecision::cache_hit(&request.id, &entry.backend_id);
            let outcome = AnalysisOutcome {
                artifact: entry.value.artifact,
                metadata: entry.value.metadata,
            };
            return Ok(JobHandle::resolved(decision, outcome, Arc::clone(&self.queue)));
        }

        let decision = self.router.route(&request).await?;
        self.persist_decision(&decision);

        match self.queue.enqueue(request, &decision.backend_id).await {
            Ok(enqueued) => Ok(JobHandle::queued(
                enqueued.job_id,
                decision,
                enqueued.state_rx,
                Arc::clone(&self.queue),
            )),
            Err(SchedulerError::BackendSaturated { backend_id, .. }) => {
                // Give the caller the would-be decision's alternatives.
                Err(SchedulerError::BackendSaturated {
                    backend_id,
                    alternatives: decision.alternatives,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Job record by id, while within its retention window
    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.queue.status(job_id)
    }

    /// Cancel a job by id
    pub fn cancel(&self, job_id: &str) -> bool {
        self.queue.cancel(job_id)
    }

    /// Metrics snapshot for one backend
    pub fn metrics(&self, backend_id: &str) -> BackendMetricsSnapshot {
        self.metrics.snapshot(backend_id)
    }

    /// Per-backend queue counters
    pub async fn queue_stats(&self) -> Vec<QueueStatsSnapshot> {
        self.queue.stats().await
    }

    /// Per-tier cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Pause dispatching for a backend
    pub fn pause_backend(&self, backend_id: &str) {
        self.queue.pause(backend_id);
    }

    /// Resume dispatching for a backend
    pub fn resume_backend(&self, backend_id: &str) {
        self.queue.resume(backend_id);
    }

    /// Backend registry, for operator tooling
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// The response cache, for operator tooling
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// Tear the service down in reverse initialization order
    ///
    /// Live jobs are cancelled; background tasks are awaited.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.queue.shutdown();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    async fn completion_loop(
        scheduler: Arc<Scheduler>,
        mut completions: mpsc::UnboundedReceiver<JobCompletion>,
    ) {
        while let Some(done) = completions.recv().await {
            if let Ok(outcome) = &done.outcome {
                scheduler.cache_result(&done, outcome).await;
            }
            scheduler.persist_job(&done.job_id);
        }
    }

    /// Feed a successful result back into the cache
    async fn cache_result(&self, done: &JobCompletion, outcome: &AnalysisOutcome) {
        let request = &done.request;
        let key = request.fingerprint.clone().unwrap_or_else(|| {
            fingerprint::request_fingerprint(&request.payload, &request.required_capabilities)
        });

        let embedding = request.embedding.clone().unwrap_or_else(|| {
            // Default projection of the entry's textual fingerprint.
            self.cache.embedder().embed(&key)
        });

        let mut entry = CacheEntry::new(
            key,
            &done.backend_id,
            request.required_capabilities.clone(),
            CacheValue {
                artifact: outcome.artifact.clone(),
                metadata: outcome.metadata.clone(),
            },
            request.kind.default_ttl_seconds(),
        )
        .with_document_fingerprint(fingerprint::document_fingerprint(&request.payload))
        .with_embedding(embedding);

        if let Some(document_type) = &request.document_type {
            entry = entry.with_document_type(document_type.clone());
        }

        self.cache.store(entry, request.tier).await;
    }

    /// Best-effort persistence of a terminal job summary
    fn persist_job(&self, job_id: &str) {
        let Some(job) = self.queue.status(job_id) else {
            return;
        };
        let Ok(bytes) = serde_json::to_vec(&job) else {
            return;
        };

        let ttl = if job.state == JobState::Completed {
            self.config.thresholds.completed_retention_secs
        } else {
            self.config.thresholds.failed_retention_secs
        };

        let shared = Arc::clone(&self.shared);
        let key = keys::job(&job.id);
        tokio::spawn(async move {
            if let Err(e) = shared.put(&key, bytes, Some(Duration::from_secs(ttl))).await {
                log::debug!("job persistence failed for {}: {}", key, e);
            }
        });
    }

    /// Best-effort persistence of a routing decision
    fn persist_decision(&self, decision: &RoutingDecision) {
        let Ok(bytes) = serde_json::to_vec(decision) else {
            return;
        };

        let shared = Arc::clone(&self.shared);
        let key = keys::routing_decision(decision.decided_at.timestamp_millis());
        tokio::spawn(async move {
            if let Err(e) = shared
                .put(&key, bytes, Some(Duration::from_secs(86_400)))
                .await
            {
                log::debug!("decision persistence failed for {}: {}", key, e);
            }
        });
    }

    /// Best-effort persistence of backend declarations
    async fn persist_registry(&self) {
        for snapshot in self.registry.list().await {
            let Ok(bytes) = serde_json::to_vec(&snapshot.spec) else {
                continue;
            };
            if let Err(e) = self
                .shared
                .put(&keys::backend_registry(&snapshot.spec.id), bytes, None)
                .await
            {
                log::debug!("registry persistence failed for {}: {}", snapshot.spec.id, e);
            }
        }
    }
}
