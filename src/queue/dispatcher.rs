//! Per-backend dispatcher task
//!
//! One long-running task per backend pops ready jobs from the priority heap
//! and runs attempts under the backend's declared concurrency and timeout.
//! Attempts race against the job's cancel token; latency and cost are
//! recorded into metrics on every attempt outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use crate::config::ThresholdConfig;
use crate::core::Clock;
use crate::error::SchedulerError;
use crate::metrics::MetricsStore;
use crate::queue::job::{JobSlot, JobState};
use crate::queue::{BackendQueue, JobCompletion, PendingJob};
use crate::registry::{AnalysisOutcome, BackendError, BackendRegistry, BackendSpec, BackendStatus, CallContext};

/// Idle poll interval when there is nothing to dispatch
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub(crate) struct DispatcherContext {
    pub backend_id: String,
    pub queue: Arc<BackendQueue>,
    pub jobs: Arc<DashMap<String, Arc<JobSlot>>>,
    pub registry: Arc<BackendRegistry>,
    pub metrics: Arc<MetricsStore>,
    pub completions: mpsc::UnboundedSender<JobCompletion>,
    pub thresholds: ThresholdConfig,
    pub seq: Arc<AtomicU64>,
}

enum AttemptOutcome {
    Done(Result<AnalysisOutcome, BackendError>),
    Cancelled,
    TimedOut,
}

/// Main dispatcher loop for one backend
pub(crate) async fn run(ctx: DispatcherContext, mut shutdown: watch::Receiver<bool>) {
    log::debug!("dispatcher started for backend {}", ctx.backend_id);

    loop {
        if *shutdown.borrow() {
            break;
        }

        if ctx.queue.is_paused() {
            idle_wait(&ctx, &mut shutdown).await;
            continue;
        }

        let Some(snapshot) = ctx.registry.get(&ctx.backend_id).await else {
            idle_wait(&ctx, &mut shutdown).await;
            continue;
        };

        // Queued jobs wait out maintenance and unavailability windows.
        if matches!(
            snapshot.status,
            BackendStatus::Unavailable | BackendStatus::Maintenance
        ) {
            idle_wait(&ctx, &mut shutdown).await;
            continue;
        }

        let Some(in_flight) = ctx.registry.in_flight_counter(&ctx.backend_id).await else {
            idle_wait(&ctx, &mut shutdown).await;
            continue;
        };

        if in_flight.load(Ordering::SeqCst) >= snapshot.spec.max_concurrent {
            idle_wait(&ctx, &mut shutdown).await;
            continue;
        }

        match ctx.queue.pop_ready(Utc::now(), &ctx.jobs) {
            Some(slot) => {
                in_flight.fetch_add(1, Ordering::SeqCst);
                ctx.queue.counters.dispatched.fetch_add(1, Ordering::Relaxed);

                let ctx = ctx.clone();
                let spec = snapshot.spec.clone();
                tokio::spawn(async move {
                    process_attempt(&ctx, slot, spec).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    ctx.queue.notify.notify_waiters();
                });
            }
            None => idle_wait(&ctx, &mut shutdown).await,
        }
    }

    log::debug!("dispatcher stopped for backend {}", ctx.backend_id);
}

async fn idle_wait(ctx: &DispatcherContext, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = shutdown.changed() => {}
        _ = tokio::time::timeout(IDLE_POLL, ctx.queue.notify.notified()) => {}
    }
}

async fn process_attempt(ctx: &DispatcherContext, slot: Arc<JobSlot>, spec: BackendSpec) {
    // A cancel that landed between pop and dispatch wins.
    if slot.cancel.is_cancelled() {
        finalize_cancelled(ctx, &slot);
        return;
    }
    if !slot.set_state(JobState::Processing) {
        // Already terminal; nothing to run.
        return;
    }

    let (job_id, request, attempt) = {
        let mut job = slot.job.write();
        job.attempts += 1;
        if job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        (job.id.clone(), job.request.clone(), job.attempts)
    };

    let handler = ctx.registry.handler(&ctx.backend_id).await;
    let call_ctx = CallContext {
        job_id: job_id.clone(),
        attempt,
    };

    let started = Clock::start();
    let outcome = match handler {
        None => AttemptOutcome::Done(Err(BackendError::Fatal(
            "backend deregistered".to_string(),
        ))),
        Some(handler) => {
            tokio::select! {
                result = handler.call(&request, &call_ctx) => AttemptOutcome::Done(result),
                _ = slot.cancel.cancelled() => AttemptOutcome::Cancelled,
                _ = tokio::time::sleep(Duration::from_secs(spec.timeout_seconds)) => AttemptOutcome::TimedOut,
            }
        }
    };
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    match outcome {
        AttemptOutcome::Cancelled => {
            finalize_cancelled(ctx, &slot);
        }
        AttemptOutcome::Done(Ok(result)) => {
            ctx.metrics
                .record(&ctx.backend_id, latency_ms, true, spec.cost_per_request);

            // A backend that beats the cancel signal still loses: the
            // result is discarded.
            if slot.cancel.is_cancelled() {
                finalize_cancelled(ctx, &slot);
                return;
            }

            {
                let mut job = slot.job.write();
                job.result = Some(result.clone());
                job.error = None;
            }
            if slot.set_state(JobState::Completed) {
                ctx.queue.counters.completed.fetch_add(1, Ordering::Relaxed);
                let _ = ctx.completions.send(JobCompletion {
                    job_id,
                    request,
                    backend_id: ctx.backend_id.clone(),
                    outcome: Ok(result),
                    latency_ms,
                });
            } else {
                // Lost a race with cancellation; the result is discarded.
                let mut job = slot.job.write();
                job.result = None;
            }
        }
        AttemptOutcome::TimedOut => {
            ctx.metrics
                .record(&ctx.backend_id, latency_ms, false, spec.cost_per_request);
            retry_or_fail(
                ctx,
                &slot,
                SchedulerError::BackendTimeout(ctx.backend_id.clone()),
            );
        }
        AttemptOutcome::Done(Err(error)) => {
            ctx.metrics
                .record(&ctx.backend_id, latency_ms, false, spec.cost_per_request);

            let error = match error {
                BackendError::Timeout => SchedulerError::BackendTimeout(ctx.backend_id.clone()),
                BackendError::Transient(msg) => SchedulerError::BackendTransient(msg),
                BackendError::Fatal(msg) => SchedulerError::BackendFatal(msg),
            };
            retry_or_fail(ctx, &slot, error);
        }
    }
}

fn finalize_cancelled(ctx: &DispatcherContext, slot: &Arc<JobSlot>) {
    if !slot.set_state(JobState::Cancelled) {
        return;
    }
    ctx.queue.counters.cancelled.fetch_add(1, Ordering::Relaxed);

    let (job_id, request) = {
        let job = slot.job.read();
        (job.id.clone(), job.request.clone())
    };
    let _ = ctx.completions.send(JobCompletion {
        job_id,
        request,
        backend_id: ctx.backend_id.clone(),
        outcome: Err(SchedulerError::Cancelled),
        latency_ms: 0.0,
    });
}

/// Re-enter the queue with backoff, or fail after the last attempt
fn retry_or_fail(ctx: &DispatcherContext, slot: &Arc<JobSlot>, error: SchedulerError) {
    let (job_id, attempts, max_attempts, priority) = {
        let job = slot.job.read();
        (job.id.clone(), job.attempts, job.max_attempts, job.priority)
    };

    if error.is_retryable() && attempts < max_attempts {
        let backoff_ms = ctx.thresholds.retry_initial_ms * 2u64.pow(attempts.saturating_sub(1));
        {
            let mut job = slot.job.write();
            job.not_before = Some(Utc::now() + chrono::Duration::milliseconds(backoff_ms as i64));
            job.error = Some(error.to_string());
        }

        if slot.set_state(JobState::Retrying) {
            ctx.queue.counters.retried.fetch_add(1, Ordering::Relaxed);
            ctx.queue.push(PendingJob {
                priority,
                seq: ctx.seq.fetch_add(1, Ordering::Relaxed),
                job_id,
            });
            return;
        }
        // Lost the race with a cancel; nothing to re-enqueue.
        return;
    }

    {
        let mut job = slot.job.write();
        job.error = Some(error.to_string());
    }
    *slot.final_error.lock() = Some(error.clone());
    if slot.set_state(JobState::Failed) {
        ctx.queue.counters.failed.fetch_add(1, Ordering::Relaxed);

        let (job_id, request) = {
            let job = slot.job.read();
            (job.id.clone(), job.request.clone())
        };
        let _ = ctx.completions.send(JobCompletion {
            job_id,
            request,
            backend_id: ctx.backend_id.clone(),
            outcome: Err(error),
            latency_ms: 0.0,
        });
    }
}
