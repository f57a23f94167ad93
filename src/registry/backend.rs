//! Backend call interface and the HTTP backend variant
//!
//! Backends differ only in how they implement `call`; the router and the
//! dispatchers treat them uniformly through the [`AnalysisBackend`] trait.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::AnalysisRequest;

/// Errors produced by a backend call or probe
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("backend call timed out")]
    Timeout,

    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("fatal backend error: {0}")]
    Fatal(String),
}

impl BackendError {
    /// Whether a job attempt failing with this error may be retried
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BackendError::Fatal(_))
    }
}

/// Result of a completed analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    /// The analysis artifact produced by the backend
    pub artifact: serde_json::Value,
    /// Backend-reported metadata (model name, token counts, scores)
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AnalysisOutcome {
    /// Wrap a bare artifact with empty metadata
    pub fn from_artifact(artifact: serde_json::Value) -> Self {
        Self {
            artifact,
            metadata: HashMap::new(),
        }
    }
}

/// Per-call context passed alongside the request
#[derive(Debug, Clone)]
pub struct CallContext {
    pub job_id: String,
    pub attempt: u32,
}

/// Capability interface implemented by every backend variant
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Perform the analysis call
    async fn call(
        &self,
        request: &AnalysisRequest,
        ctx: &CallContext,
    ) -> Result<AnalysisOutcome, BackendError>;

    /// Lightweight health probe
    async fn probe(&self) -> Result<(), BackendError>;
}

/// HTTP backend posting requests to a remote analysis endpoint
pub struct HttpAnalysisBackend {
    client: reqwest::Client,
    endpoint: String,
    health_endpoint: String,
}

impl HttpAnalysisBackend {
    /// Create a client for `endpoint` with the given per-call timeout
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let endpoint = endpoint.into();
        let health_endpoint = format!("{}/health", endpoint.trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            endpoint,
            health_endpoint,
        }
    }

    fn classify(error: reqwest::Error) -> BackendError {
        if error.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Transient(error.to_string())
        }
    }

    fn classify_status(status: reqwest::StatusCode) -> Option<BackendError> {
        if status.is_success() {
            None
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            Some(BackendError::Fatal(format!("authentication rejected: {}", status)))
        } else if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            Some(BackendError::Fatal(format!("protocol error: {}", status)))
        } else {
            Some(BackendError::Transient(format!("server error: {}", status)))
        }
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisBackend {
    async fn call(
        &self,
        request: &AnalysisRequest,
        ctx: &CallContext,
    ) -> Result<AnalysisOutcome, BackendError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-job-id", &ctx.job_id)
            .header("x-attempt", ctx.attempt.to_string())
            .json(request)
            .send()
            .await
            .map_err(Self::classify)?;

        if let Some(err) = Self::classify_status(response.status()) {
            return Err(err);
        }

        let artifact: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("malformed response body: {}", e)))?;

        Ok(AnalysisOutcome::from_artifact(artifact))
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(&self.health_endpoint)
            .send()
            .await
            .map_err(Self::classify)?;

        match Self::classify_status(response.status()) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
