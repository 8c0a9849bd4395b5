//! The configuration matrix: stored configurations, request-path
//! resolution, shared generation logic, and priority fill.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::params::{AnalysisParameters, ConfigKey};

pub mod generator;
pub mod planner;
pub mod resolver;

pub use generator::{Generation, Generator};
pub use planner::{FillFailure, FillSummary, PriorityFillPlanner};
pub use resolver::MatrixResolver;

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    4_096
}

fn default_top_p() -> f32 {
    0.95
}

/// A concrete model plus the sampling settings to call it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Suitability score at generation time.
    #[serde(default)]
    pub suitability: Option<f64>,
}

impl ModelSelection {
    pub fn id(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpectedMetrics {
    pub latency_ms: f64,
    pub cost_per_1k: f64,
    pub quality_score: f64,
    pub success_rate: f64,
}

/// One cache entry. Superseded by a new write with the same key, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedConfiguration {
    pub key: ConfigKey,
    pub parameters: AnalysisParameters,
    pub selected_model: ModelSelection,
    pub expected_metrics: ExpectedMetrics,
    pub fallback_models: Vec<ModelSelection>,
    pub generated_at: DateTime<Utc>,
    pub last_validated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    /// Produced by the heuristic path rather than the recommender.
    pub degraded: bool,
    pub notes: Option<String>,
    /// Flagged for out-of-band maintenance.
    pub needs_refresh: bool,
}

impl GeneratedConfiguration {
    /// Older than `max_age` since the last validation.
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now - self.last_validated_at > max_age
    }
}

/// Where a resolved configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Fresh store hit.
    Cached,
    /// This caller ran the recommender.
    Generated,
    /// Another caller's in-flight generation.
    Joined,
    /// Heuristic synthesis after a failure or timeout.
    Heuristic,
    /// Served from an old or last-known-good copy because regeneration or
    /// the store failed.
    LastGood,
}

/// What a resolver caller receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub configuration: GeneratedConfiguration,
    pub degraded: bool,
    pub source: ResolutionSource,
}
