//! Job model, state machine, and cancellation token

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};

use crate::core::ids;
use crate::registry::AnalysisOutcome;
use crate::request::{AnalysisRequest, PrincipalTier, RequestPriority};

/// Job lifecycle states
///
/// Valid transitions: pending → processing → {completed, failed, retrying,
/// cancelled}; retrying → processing; pending → cancelled. Terminal states
/// are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl JobState {
    /// Whether this state ends the job
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

/// Cooperative cancellation token carried with each job
///
/// Cancellation propagates handle → job → in-flight backend call; the
/// dispatcher races the call against this token.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Request cancellation; idempotent
    ///
    /// Returns whether this call was the first to cancel.
    pub fn cancel(&self) -> bool {
        let first = !self.flag.swap(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        first
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            // Periodic re-check closes the window between the flag check and
            // waiter registration.
            let _ = tokio::time::timeout(Duration::from_millis(50), self.notify.notified()).await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of work owned by a backend queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub request: AnalysisRequest,
    pub backend_id: String,
    pub state: JobState,
    /// Effective queue priority, higher dispatches first
    pub priority: u32,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Dispatch is deferred until this instant (rate shaping, retry backoff)
    pub not_before: Option<DateTime<Utc>>,
    pub result: Option<AnalysisOutcome>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job for a routed request
    pub fn new(
        request: AnalysisRequest,
        backend_id: impl Into<String>,
        max_attempts: u32,
        free_tier_delay: Duration,
    ) -> Self {
        let priority = request.queue_priority();

        // Free-tier, non-urgent traffic is rate-shaped with a small fixed
        // delay; it still dispatches strictly by priority once eligible.
        let not_before = (request.tier == PrincipalTier::Free
            && request.priority != RequestPriority::Urgent)
            .then(|| Utc::now() + chrono::Duration::milliseconds(free_tier_delay.as_millis() as i64));

        Self {
            id: ids::job_id(),
            request,
            backend_id: backend_id.into(),
            state: JobState::Pending,
            priority,
            attempts: 0,
            max_attempts,
            not_before,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether the job may be dispatched at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }
}

/// Shared mutable slot for a job and its signalling primitives
pub struct JobSlot {
    pub job: RwLock<Job>,
    pub cancel: CancelToken,
    /// Typed error of the final failed attempt
    pub final_error: parking_lot::Mutex<Option<crate::error::SchedulerError>>,
    state_tx: watch::Sender<JobState>,
}

impl JobSlot {
    /// Wrap a freshly created job
    pub fn new(job: Job) -> Arc<Self> {
        let (state_tx, _) = watch::channel(job.state);
        Arc::new(Self {
            job: RwLock::new(job),
            cancel: CancelToken::new(),
            final_error: parking_lot::Mutex::new(None),
            state_tx,
        })
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    /// Current state
    pub fn state(&self) -> JobState {
        self.job.read().state
    }

    /// Transition the job, stamping completion time on terminal states
    ///
    /// Terminal states are immutable; a transition out of one is ignored.
    pub fn set_state(&self, state: JobState) -> bool {
        let mut job = self.job.write();
        if job.state.is_terminal() {
            return false;
        }

        job.state = state;
        if state.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        drop(job);

        let _ = self.state_tx.send(state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{PrincipalTier, RequestKind};

    fn request(tier: PrincipalTier, priority: RequestPriority) -> AnalysisRequest {
        AnalysisRequest::new("acct-1", tier, RequestKind::QuickScan, serde_json::Value::Null)
            .with_priority(priority)
    }

    #[test]
    fn test_free_tier_jobs_are_delayed() {
        let job = Job::new(
            request(PrincipalTier::Free, RequestPriority::Low),
            "b1",
            3,
            Duration::from_secs(1),
        );
        assert!(job.not_before.is_some());
        assert!(!job.is_ready(Utc::now()));
        assert!(job.is_ready(Utc::now() + chrono::Duration::seconds(2)));
    }

    #[test]
    fn test_urgent_free_jobs_are_not_delayed() {
        let job = Job::new(
            request(PrincipalTier::Free, RequestPriority::Urgent),
            "b1",
            3,
            Duration::from_secs(1),
        );
        assert!(job.not_before.is_none());
    }

    #[test]
    fn test_paid_jobs_are_not_delayed() {
        let job = Job::new(
            request(PrincipalTier::Enterprise, RequestPriority::Low),
            "b1",
            3,
            Duration::from_secs(1),
        );
        assert!(job.not_before.is_none());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let slot = JobSlot::new(Job::new(
            request(PrincipalTier::Free, RequestPriority::Medium),
            "b1",
            3,
            Duration::ZERO,
        ));

        assert!(slot.set_state(JobState::Processing));
        assert!(slot.set_state(JobState::Completed));
        assert!(!slot.set_state(JobState::Failed));
        assert_eq!(slot.state(), JobState::Completed);
        assert!(slot.job.read().completed_at.is_some());
    }

    #[test]
    fn test_state_subscription() {
        let slot = JobSlot::new(Job::new(
            request(PrincipalTier::Free, RequestPriority::Medium),
            "b1",
            3,
            Duration::ZERO,
        ));

        let rx = slot.subscribe();
        slot.set_state(JobState::Processing);
        assert_eq!(*rx.borrow(), JobState::Processing);
    }

    #[tokio::test]
    async fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());

        // Resolves immediately once cancelled.
        tokio::time::timeout(Duration::from_millis(200), token.cancelled())
            .await
            .unwrap();
    }
}
