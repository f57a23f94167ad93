//! Error types for the scheduling core
//!
//! Every error a caller can observe from the facade is one of the variants
//! below. Cache-tier failures are intentionally absent: they are logged and
//! degrade to the remaining tiers without ever reaching the caller.

use thiserror::Error;

/// Scheduler errors surfaced through the facade
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No eligible backend for request {0}")]
    NoEligibleBackend(String),

    #[error("Backend {backend_id} saturated")]
    BackendSaturated {
        /// The backend whose pending ceiling was hit
        backend_id: String,
        /// Alternatives from the routing decision, best first
        alternatives: Vec<String>,
    },

    #[error("Backend {0} timed out")]
    BackendTimeout(String),

    #[error("Transient backend error: {0}")]
    BackendTransient(String),

    #[error("Fatal backend error: {0}")]
    BackendFatal(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    /// Whether a failed attempt with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::BackendTimeout(_) | SchedulerError::BackendTransient(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SchedulerError::BackendTimeout("b1".to_string()).is_retryable());
        assert!(SchedulerError::BackendTransient("reset".to_string()).is_retryable());
        assert!(!SchedulerError::BackendFatal("bad key".to_string()).is_retryable());
        assert!(!SchedulerError::Cancelled.is_retryable());
    }
}
