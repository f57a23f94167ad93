//! Analysis request model
//!
//! This module defines:
//! - The closed capability vocabulary shared by requests and backends
//! - Principal tiers, request kinds, priorities, and complexity classes
//! - The immutable [`AnalysisRequest`] submitted to the scheduler

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Analysis capability from the closed vocabulary
///
/// A backend declares the capabilities it can serve; a request declares the
/// capabilities it requires. A backend is eligible only when its declared set
/// is a superset of the request's required set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    DocumentAnalysis,
    PatternDetection,
    LegalInterpretation,
    RiskAssessment,
    MarketingAnalysis,
    SalesInsights,
    CustomerAnalytics,
    BusinessIntelligence,
}

impl Capability {
    /// All capabilities in the vocabulary
    pub const ALL: [Capability; 8] = [
        Capability::DocumentAnalysis,
        Capability::PatternDetection,
        Capability::LegalInterpretation,
        Capability::RiskAssessment,
        Capability::MarketingAnalysis,
        Capability::SalesInsights,
        Capability::CustomerAnalytics,
        Capability::BusinessIntelligence,
    ];

    /// Canonical string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::DocumentAnalysis => "document-analysis",
            Capability::PatternDetection => "pattern-detection",
            Capability::LegalInterpretation => "legal-interpretation",
            Capability::RiskAssessment => "risk-assessment",
            Capability::MarketingAnalysis => "marketing-analysis",
            Capability::SalesInsights => "sales-insights",
            Capability::CustomerAnalytics => "customer-analytics",
            Capability::BusinessIntelligence => "business-intelligence",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| SchedulerError::InvalidArgument(format!("unknown capability: {}", s)))
    }
}

/// Class of the submitting principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrincipalTier {
    Free,
    Premium,
    Enterprise,
}

impl PrincipalTier {
    /// Queue priority contribution
    pub fn weight(&self) -> u32 {
        match self {
            PrincipalTier::Enterprise => 1000,
            PrincipalTier::Premium => 500,
            PrincipalTier::Free => 0,
        }
    }

    /// Cost-estimate discount factor
    pub fn discount(&self) -> f64 {
        match self {
            PrincipalTier::Free => 1.0,
            PrincipalTier::Premium => 0.8,
            PrincipalTier::Enterprise => 0.6,
        }
    }

    /// Routing score bonus
    pub fn score_bonus(&self) -> f64 {
        match self {
            PrincipalTier::Enterprise => 10.0,
            PrincipalTier::Premium => 5.0,
            PrincipalTier::Free => 0.0,
        }
    }
}

impl FromStr for PrincipalTier {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(PrincipalTier::Free),
            "premium" => Ok(PrincipalTier::Premium),
            "enterprise" => Ok(PrincipalTier::Enterprise),
            other => Err(SchedulerError::InvalidArgument(format!(
                "unknown principal tier: {}",
                other
            ))),
        }
    }
}

/// Kind of analysis requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    DocAnalysis,
    QuickScan,
    DetailedReview,
    PatternSearch,
    RiskAssessment,
    BusinessQuery,
}

impl RequestKind {
    /// Default cache TTL in seconds for results of this kind
    pub fn default_ttl_seconds(&self) -> u64 {
        match self {
            RequestKind::DocAnalysis => 86_400,
            RequestKind::QuickScan => 3_600,
            RequestKind::DetailedReview => 172_800,
            RequestKind::PatternSearch => 43_200,
            RequestKind::RiskAssessment => 86_400,
            RequestKind::BusinessQuery => 21_600,
        }
    }
}

impl FromStr for RequestKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "doc-analysis" => Ok(RequestKind::DocAnalysis),
            "quick-scan" => Ok(RequestKind::QuickScan),
            "detailed-review" => Ok(RequestKind::DetailedReview),
            "pattern-search" => Ok(RequestKind::PatternSearch),
            "risk-assessment" => Ok(RequestKind::RiskAssessment),
            "business-query" => Ok(RequestKind::BusinessQuery),
            other => Err(SchedulerError::InvalidArgument(format!(
                "unknown request kind: {}",
                other
            ))),
        }
    }
}

/// Request priority levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum RequestPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl RequestPriority {
    /// Queue priority contribution
    pub fn weight(&self) -> u32 {
        match self {
            RequestPriority::Urgent => 400,
            RequestPriority::High => 300,
            RequestPriority::Medium => 200,
            RequestPriority::Low => 100,
        }
    }
}

impl FromStr for RequestPriority {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RequestPriority::Low),
            "medium" => Ok(RequestPriority::Medium),
            "high" => Ok(RequestPriority::High),
            "urgent" => Ok(RequestPriority::Urgent),
            other => Err(SchedulerError::InvalidArgument(format!(
                "unknown priority: {}",
                other
            ))),
        }
    }
}

/// Estimated complexity of the analysis
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

impl Complexity {
    /// Multiplier applied to a backend's declared mean latency
    pub fn latency_multiplier(&self) -> f64 {
        match self {
            Complexity::Simple => 0.7,
            Complexity::Moderate => 1.0,
            Complexity::Complex => 1.5,
            Complexity::VeryComplex => 2.0,
        }
    }

    /// Multiplier applied to a backend's declared cost per request
    pub fn cost_multiplier(&self) -> f64 {
        match self {
            Complexity::Simple => 0.8,
            Complexity::Moderate => 1.0,
            Complexity::Complex => 1.5,
            Complexity::VeryComplex => 2.0,
        }
    }

    /// Queue priority contribution for heavyweight work
    pub fn priority_bonus(&self) -> u32 {
        match self {
            Complexity::Simple | Complexity::Moderate => 0,
            Complexity::Complex => 25,
            Complexity::VeryComplex => 50,
        }
    }

    /// Whether this class is routed to dedicated heavy backends
    pub fn is_heavy(&self) -> bool {
        matches!(self, Complexity::Complex | Complexity::VeryComplex)
    }
}

impl FromStr for Complexity {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Complexity::Simple),
            "moderate" => Ok(Complexity::Moderate),
            "complex" => Ok(Complexity::Complex),
            "very-complex" => Ok(Complexity::VeryComplex),
            other => Err(SchedulerError::InvalidArgument(format!(
                "unknown complexity: {}",
                other
            ))),
        }
    }
}

/// An immutable document-analysis request
///
/// Created by the facade at submission time. The optional fingerprint and
/// embedding enable exact and semantic cache lookups; when the fingerprint is
/// absent the facade computes one from the payload and capability set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub id: String,
    pub principal_id: String,
    pub tier: PrincipalTier,
    pub kind: RequestKind,
    pub priority: RequestPriority,
    pub complexity: Complexity,
    pub required_capabilities: HashSet<Capability>,
    pub deadline: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    pub document_type: Option<String>,
    pub fingerprint: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl AnalysisRequest {
    /// Create a new request with default priority and complexity
    pub fn new(
        principal_id: impl Into<String>,
        tier: PrincipalTier,
        kind: RequestKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: crate::core::ids::request_id(),
            principal_id: principal_id.into(),
            tier,
            kind,
            priority: RequestPriority::Medium,
            complexity: Complexity::Moderate,
            required_capabilities: HashSet::new(),
            deadline: None,
            payload,
            document_type: None,
            fingerprint: None,
            embedding: None,
            created_at: Utc::now(),
        }
    }

    /// Set request priority
    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set complexity class
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// Add a required capability
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.required_capabilities.insert(capability);
        self
    }

    /// Replace the required capability set
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.required_capabilities = capabilities.into_iter().collect();
        self
    }

    /// Set a completion deadline
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the document type used by semantic cache filters
    pub fn with_document_type(mut self, document_type: impl Into<String>) -> Self {
        self.document_type = Some(document_type.into());
        self
    }

    /// Attach a precomputed fingerprint
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Attach an embedding vector for semantic cache lookup
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Total queue priority of this request
    pub fn queue_priority(&self) -> u32 {
        self.tier.weight() + self.priority.weight() + self.complexity.priority_bonus()
    }
}
