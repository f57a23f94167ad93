//! End-to-end scheduler integration tests
//!
//! These tests drive the full pipeline: submit → cache lookup → routing →
//! queue dispatch → completion → cache feedback, using in-process backend
//! mocks and in-memory cache stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use finelens::cache::{CacheEntry, CacheValue};
use finelens::config::FinelensConfig;
use finelens::core::fingerprint;
use finelens::registry::{
    AnalysisBackend, AnalysisOutcome, BackendError, BackendKind, BackendSpec, CallContext,
};
use finelens::request::{
    AnalysisRequest, Capability, Complexity, PrincipalTier, RequestKind, RequestPriority,
};
use finelens::scheduler::{AwaitOutcome, Scheduler};
use finelens::queue::JobState;
use finelens::SchedulerError;

#[derive(Clone)]
enum MockBehavior {
    Succeed(serde_json::Value),
    Transient,
}

struct MockBackend {
    behavior: MockBehavior,
    delay: Duration,
    calls: Arc<AtomicU32>,
    log: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    fn succeeding(artifact: serde_json::Value) -> (Arc<Self>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let backend = Arc::new(Self {
            behavior: MockBehavior::Succeed(artifact),
            delay: Duration::from_millis(10),
            calls: Arc::clone(&calls),
            log: Arc::new(Mutex::new(Vec::new())),
        });
        (backend, calls)
    }

    fn failing() -> (Arc<Self>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let backend = Arc::new(Self {
            behavior: MockBehavior::Transient,
            delay: Duration::from_millis(5),
            calls: Arc::clone(&calls),
            log: Arc::new(Mutex::new(Vec::new())),
        });
        (backend, calls)
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            behavior: MockBehavior::Succeed(serde_json::json!({"slow": true})),
            delay,
            calls: Arc::new(AtomicU32::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn ordered(log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            behavior: MockBehavior::Succeed(serde_json::json!({"ok": true})),
            delay: Duration::from_millis(50),
            calls: Arc::new(AtomicU32::new(0)),
            log,
        })
    }
}

#[async_trait]
impl AnalysisBackend for MockBackend {
    async fn call(
        &self,
        request: &AnalysisRequest,
        _ctx: &CallContext,
    ) -> Result<AnalysisOutcome, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(request.principal_id.clone());
        tokio::time::sleep(self.delay).await;

        match &self.behavior {
            MockBehavior::Succeed(artifact) => Ok(AnalysisOutcome::from_artifact(artifact.clone())),
            MockBehavior::Transient => Err(BackendError::Transient("synthetic failure".to_string())),
        }
    }

    async fn probe(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

fn base_config(backends: Vec<BackendSpec>) -> FinelensConfig {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut config = FinelensConfig::default();
    config.backends = backends;
    // Keep tests fast.
    config.thresholds.retry_initial_ms = 10;
    config.thresholds.free_tier_delay_ms = 20;
    config.maintenance.interval_secs = 3600;
    config
}

fn doc_spec(id: &str) -> BackendSpec {
    BackendSpec::new(id, BackendKind::Primary, format!("http://{}.internal", id))
        .with_capability(Capability::DocumentAnalysis)
        .with_avg_latency_ms(1000)
        .with_max_concurrent(1)
}

fn doc_request(payload: &str) -> AnalysisRequest {
    AnalysisRequest::new(
        "acct-test",
        PrincipalTier::Premium,
        RequestKind::DocAnalysis,
        serde_json::json!(payload),
    )
    .with_capability(Capability::DocumentAnalysis)
}

async fn wait_ready(
    handle: &mut finelens::JobHandle,
    timeout: Duration,
) -> Result<AnalysisOutcome, SchedulerError> {
    match handle.wait(Some(timeout)).await {
        AwaitOutcome::Ready(result) => result,
        AwaitOutcome::Pending => panic!("job did not finish within {:?}", timeout),
    }
}

#[tokio::test]
async fn test_submit_completes_and_second_submit_hits_cache() {
    let (backend, calls) = MockBackend::succeeding(serde_json::json!({"risk": "low"}));
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), backend);

    let scheduler = Scheduler::start(base_config(vec![doc_spec("b1")]), handlers)
        .await
        .unwrap();

    let mut handle = scheduler.submit(doc_request("same doc")).await.unwrap();
    assert!(!handle.cache_hit());

    let outcome = wait_ready(&mut handle, Duration::from_secs(10)).await.unwrap();
    assert_eq!(outcome.artifact, serde_json::json!({"risk": "low"}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Give the completion loop a beat to feed the cache.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut second = scheduler.submit(doc_request("same doc")).await.unwrap();
    assert!(second.cache_hit());
    assert_eq!(second.decision().reason, "cache-hit");

    let cached = wait_ready(&mut second, Duration::from_secs(1)).await.unwrap();
    assert_eq!(cached.artifact, outcome.artifact);
    // No additional backend call was made.
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_preloaded_cache_serves_urgent_simple_without_dispatch() {
    let (backend, calls) = MockBackend::succeeding(serde_json::json!({"unused": true}));
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), backend);

    let scheduler = Scheduler::start(base_config(vec![doc_spec("b1")]), handlers)
        .await
        .unwrap();

    // Preload the cache under the exact fingerprint the submission computes.
    let payload = serde_json::json!("A");
    let caps = [Capability::DocumentAnalysis].into_iter().collect();
    let key = fingerprint::request_fingerprint(&payload, &caps);
    scheduler
        .cache()
        .store(
            CacheEntry::new(
                key,
                "b1",
                caps,
                CacheValue::from_artifact(serde_json::json!({"verdict": "V"})),
                3600,
            ),
            PrincipalTier::Premium,
        )
        .await;

    let request = doc_request("A")
        .with_priority(RequestPriority::Urgent)
        .with_complexity(Complexity::Simple);
    let mut handle = scheduler.submit(request).await.unwrap();

    assert!(handle.cache_hit());
    let report = handle.status();
    assert_eq!(report.state, JobState::Completed);

    let outcome = wait_ready(&mut handle, Duration::from_secs(1)).await.unwrap();
    assert_eq!(outcome.artifact, serde_json::json!({"verdict": "V"}));

    // No backend was dispatched and nothing is in flight.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let snapshot = scheduler.registry().get("b1").await.unwrap();
    assert_eq!(snapshot.in_flight, 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_capability_filter_selects_capable_backend() {
    let (b1, _) = MockBackend::succeeding(serde_json::json!({}));
    let (b2, _) = MockBackend::succeeding(serde_json::json!({}));
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), b1);
    handlers.insert("b2".to_string(), b2);

    let specs = vec![
        doc_spec("b1"),
        doc_spec("b2").with_capability(Capability::LegalInterpretation),
    ];
    let scheduler = Scheduler::start(base_config(specs), handlers).await.unwrap();

    let request = doc_request("contract").with_capability(Capability::LegalInterpretation);
    let handle = scheduler.submit(request).await.unwrap();

    assert_eq!(handle.decision().backend_id, "b2");
    assert!(!handle.decision().alternatives.contains(&"b1".to_string()));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_priority_order_within_paused_queue() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), MockBackend::ordered(Arc::clone(&log)));

    let scheduler = Scheduler::start(base_config(vec![doc_spec("b1")]), handlers)
        .await
        .unwrap();

    scheduler.pause_backend("b1");

    let j_free = AnalysisRequest::new(
        "acct-free",
        PrincipalTier::Free,
        RequestKind::DocAnalysis,
        serde_json::json!("free job"),
    )
    .with_capability(Capability::DocumentAnalysis)
    .with_priority(RequestPriority::Low);

    let j_ent = AnalysisRequest::new(
        "acct-ent",
        PrincipalTier::Enterprise,
        RequestKind::DocAnalysis,
        serde_json::json!("enterprise job"),
    )
    .with_capability(Capability::DocumentAnalysis)
    .with_priority(RequestPriority::Urgent);

    let mut h_free = scheduler.submit(j_free).await.unwrap();
    let mut h_ent = scheduler.submit(j_ent).await.unwrap();

    scheduler.resume_backend("b1");

    wait_ready(&mut h_ent, Duration::from_secs(10)).await.unwrap();
    wait_ready(&mut h_free, Duration::from_secs(10)).await.unwrap();

    let order = log.lock().clone();
    assert_eq!(order, vec!["acct-ent".to_string(), "acct-free".to_string()]);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_free_tier_routes_to_cheapest_backend() {
    let (cheap, _) = MockBackend::succeeding(serde_json::json!({}));
    let (fast, _) = MockBackend::succeeding(serde_json::json!({}));
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b_cheap".to_string(), cheap);
    handlers.insert("b_fast".to_string(), fast);

    let specs = vec![
        doc_spec("b_cheap").with_cost(0.001).with_avg_latency_ms(30_000),
        doc_spec("b_fast").with_cost(0.01).with_avg_latency_ms(1_000),
    ];
    let scheduler = Scheduler::start(base_config(specs), handlers).await.unwrap();

    let request = AnalysisRequest::new(
        "acct-free",
        PrincipalTier::Free,
        RequestKind::DocAnalysis,
        serde_json::json!("budget doc"),
    )
    .with_capability(Capability::DocumentAnalysis)
    .with_priority(RequestPriority::Medium)
    .with_complexity(Complexity::Moderate);

    let handle = scheduler.submit(request).await.unwrap();
    assert_eq!(handle.decision().backend_id, "b_cheap");

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_transient_failures_retry_then_fail() {
    let (backend, calls) = MockBackend::failing();
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), backend);

    let scheduler = Scheduler::start(base_config(vec![doc_spec("b1")]), handlers)
        .await
        .unwrap();

    let mut handle = scheduler.submit(doc_request("doomed")).await.unwrap();
    let result = wait_ready(&mut handle, Duration::from_secs(10)).await;

    assert!(matches!(result, Err(SchedulerError::BackendTransient(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let job = scheduler.job(handle.job_id()).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);

    // All three attempts are visible in metrics.
    let metrics = scheduler.metrics("b1");
    assert_eq!(metrics.total_requests, 3);
    assert_eq!(metrics.failures, 3);
    assert_eq!(metrics.successes, 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_semantic_cache_hit_records_similarity() {
    let (backend, calls) = MockBackend::succeeding(serde_json::json!({}));
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), backend);

    let mut config = base_config(vec![doc_spec("b1")]);
    config.cache.similarity.dimensions = 3;
    config.cache.similarity.threshold = 0.9;

    let scheduler = Scheduler::start(config, handlers).await.unwrap();

    let caps: std::collections::HashSet<Capability> =
        [Capability::DocumentAnalysis].into_iter().collect();
    scheduler
        .cache()
        .store(
            CacheEntry::new(
                "stored-under-other-key",
                "b1",
                caps,
                CacheValue::from_artifact(serde_json::json!({"summary": "near match"})),
                3600,
            )
            .with_document_type("tos")
            .with_embedding(vec![1.0, 0.0, 0.0]),
            PrincipalTier::Premium,
        )
        .await;

    let request = doc_request("a slightly different document")
        .with_document_type("tos")
        .with_embedding(vec![0.99, 0.01, 0.0]);
    let mut handle = scheduler.submit(request).await.unwrap();

    assert!(handle.cache_hit());
    let outcome = wait_ready(&mut handle, Duration::from_secs(1)).await.unwrap();
    assert_eq!(outcome.artifact, serde_json::json!({"summary": "near match"}));
    assert!(outcome.metadata.contains_key("similarity_score"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_zero_norm_embedding_falls_back_to_exact_match() {
    let (backend, _) = MockBackend::succeeding(serde_json::json!({"fresh": true}));
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), backend);

    let mut config = base_config(vec![doc_spec("b1")]);
    config.cache.similarity.dimensions = 3;

    let scheduler = Scheduler::start(config, handlers).await.unwrap();

    let request = doc_request("new doc").with_embedding(vec![0.0, 0.0, 0.0]);
    let handle = scheduler.submit(request).await.unwrap();

    // Nothing cached under the exact key, so this dispatches.
    assert!(!handle.cache_hit());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_cancel_pending_job_is_idempotent() {
    let (backend, _) = MockBackend::succeeding(serde_json::json!({}));
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), backend);

    let scheduler = Scheduler::start(base_config(vec![doc_spec("b1")]), handlers)
        .await
        .unwrap();

    scheduler.pause_backend("b1");
    let handle = scheduler.submit(doc_request("never runs")).await.unwrap();

    assert!(handle.cancel());
    assert!(!handle.cancel());

    let job = scheduler.job(handle.job_id()).unwrap();
    assert_eq!(job.state, JobState::Cancelled);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_cancel_processing_job_discards_result() {
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), MockBackend::slow(Duration::from_secs(30)));

    let scheduler = Scheduler::start(base_config(vec![doc_spec("b1")]), handlers)
        .await
        .unwrap();

    let mut handle = scheduler.submit(doc_request("long analysis")).await.unwrap();

    // Wait until the job is actually in flight.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(job) = scheduler.job(handle.job_id()) {
            if job.state == JobState::Processing {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(handle.cancel());
    let result = wait_ready(&mut handle, Duration::from_secs(5)).await;
    assert!(matches!(result, Err(SchedulerError::Cancelled)));

    let job = scheduler.job(handle.job_id()).unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.result.is_none());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_cancelling_terminal_job_returns_false() {
    let (backend, _) = MockBackend::succeeding(serde_json::json!({}));
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), backend);

    let scheduler = Scheduler::start(base_config(vec![doc_spec("b1")]), handlers)
        .await
        .unwrap();

    let mut handle = scheduler.submit(doc_request("quick")).await.unwrap();
    wait_ready(&mut handle, Duration::from_secs(10)).await.unwrap();

    assert!(!handle.cancel());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_saturated_queue_rejects_with_alternatives() {
    let (b1, _) = MockBackend::succeeding(serde_json::json!({}));
    let (b2, _) = MockBackend::succeeding(serde_json::json!({}));
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), b1);
    handlers.insert("b2".to_string(), b2);

    let mut config = base_config(vec![
        // b1 wins routing on latency for premium traffic.
        doc_spec("b1").with_avg_latency_ms(100),
        doc_spec("b2").with_avg_latency_ms(50_000),
    ]);
    config.thresholds.queue_saturation_ceiling = 1;

    let scheduler = Scheduler::start(config, handlers).await.unwrap();
    scheduler.pause_backend("b1");

    scheduler.submit(doc_request("first")).await.unwrap();
    let second = scheduler.submit(doc_request("second")).await;

    match second {
        Err(SchedulerError::BackendSaturated { backend_id, alternatives }) => {
            assert_eq!(backend_id, "b1");
            assert!(alternatives.contains(&"b2".to_string()));
        }
        other => panic!("expected saturation, got {:?}", other.map(|h| h.decision().clone())),
    }

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_no_eligible_backend_is_reported() {
    let (backend, _) = MockBackend::succeeding(serde_json::json!({}));
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), backend);

    let scheduler = Scheduler::start(base_config(vec![doc_spec("b1")]), handlers)
        .await
        .unwrap();

    let request = AnalysisRequest::new(
        "acct-1",
        PrincipalTier::Premium,
        RequestKind::DocAnalysis,
        serde_json::json!("unservable"),
    )
    .with_capability(Capability::CustomerAnalytics);

    assert!(matches!(
        scheduler.submit(request).await,
        Err(SchedulerError::NoEligibleBackend(_))
    ));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_embedding_dimension_mismatch_is_invalid_argument() {
    let (backend, _) = MockBackend::succeeding(serde_json::json!({}));
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), backend);

    let mut config = base_config(vec![doc_spec("b1")]);
    config.cache.similarity.dimensions = 8;

    let scheduler = Scheduler::start(config, handlers).await.unwrap();

    let request = doc_request("doc").with_embedding(vec![1.0, 0.0]);
    assert!(matches!(
        scheduler.submit(request).await,
        Err(SchedulerError::InvalidArgument(_))
    ));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_queue_and_cache_stats_reflect_activity() {
    let (backend, _) = MockBackend::succeeding(serde_json::json!({"ok": 1}));
    let mut handlers: HashMap<String, Arc<dyn AnalysisBackend>> = HashMap::new();
    handlers.insert("b1".to_string(), backend);

    let scheduler = Scheduler::start(base_config(vec![doc_spec("b1")]), handlers)
        .await
        .unwrap();

    let mut handle = scheduler.submit(doc_request("stats doc")).await.unwrap();
    wait_ready(&mut handle, Duration::from_secs(10)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let queue_stats = scheduler.queue_stats().await;
    let b1 = queue_stats.iter().find(|s| s.backend_id == "b1").unwrap();
    assert_eq!(b1.enqueued, 1);
    assert_eq!(b1.completed, 1);
    assert_eq!(b1.pending, 0);

    // The completed result was fed back into the cache.
    let mut second = scheduler.submit(doc_request("stats doc")).await.unwrap();
    wait_ready(&mut second, Duration::from_secs(1)).await.unwrap();
    let cache_stats = scheduler.cache_stats();
    assert!(cache_stats.memory.hits >= 1);

    scheduler.shutdown().await;
}
