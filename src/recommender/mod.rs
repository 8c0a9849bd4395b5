//! Recommender interface: decides which model a parameter tuple should use.
//!
//! The matrix treats every recommender as an external collaborator that may
//! be slow or fail. Callers always wrap `recommend` in a timeout, and
//! implementations must be safe to retry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::matrix::{ExpectedMetrics, ModelSelection};
use crate::params::AnalysisParameters;

pub mod heuristic;
pub mod http;

pub use heuristic::HeuristicRecommender;
pub use http::HttpRecommender;

/// What a recommender returns. The resolver stamps key, parameters and
/// timestamps to turn this into a stored configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub selected_model: ModelSelection,
    #[serde(default)]
    pub fallback_models: Vec<ModelSelection>,
    pub expected_metrics: ExpectedMetrics,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RecommenderError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("no active candidates for the request")]
    NoCandidates,
}

#[async_trait]
pub trait Recommender: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    async fn recommend(&self, params: &AnalysisParameters) -> Result<Recommendation, RecommenderError>;
}
