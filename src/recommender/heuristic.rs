//! Heuristic recommender: top suitability score from the catalog.
//!
//! Used directly when no external reasoning service is configured, and by
//! the generator as the deterministic fallback when one fails.

use async_trait::async_trait;
use std::sync::Arc;

use super::{Recommendation, Recommender, RecommenderError};
use crate::catalog::{ModelCandidate, ModelCatalog};
use crate::matrix::{ExpectedMetrics, ModelSelection};
use crate::params::{AnalysisParameters, AnalysisType, QualityRequirement, RepoSize};
use crate::scoring::{ScoredCandidate, SuitabilityScorer};

pub struct HeuristicRecommender {
    catalog: Arc<dyn ModelCatalog>,
    scorer: SuitabilityScorer,
    fallback_count: usize,
    success_rate: f64,
}

impl HeuristicRecommender {
    pub fn new(
        catalog: Arc<dyn ModelCatalog>,
        scorer: SuitabilityScorer,
        fallback_count: usize,
        success_rate: f64,
    ) -> Self {
        Self {
            catalog,
            scorer,
            fallback_count,
            success_rate,
        }
    }

    /// Deterministic synthesis from the active catalog.
    pub fn synthesize(&self, params: &AnalysisParameters) -> Result<Recommendation, RecommenderError> {
        let ranked = self.scorer.rank(&self.catalog.list_active(), params);
        let (best, rest) = ranked.split_first().ok_or(RecommenderError::NoCandidates)?;

        Ok(Recommendation {
            selected_model: selection_for(&best.candidate, params, Some(best.score)),
            fallback_models: rest
                .iter()
                .take(self.fallback_count)
                .map(|s| selection_for(&s.candidate, params, Some(s.score)))
                .collect(),
            expected_metrics: estimate_metrics(best, params, self.success_rate),
            rationale: Some(format!(
                "highest suitability {:.2} of {} active candidates",
                best.score,
                ranked.len()
            )),
        })
    }
}

#[async_trait]
impl Recommender for HeuristicRecommender {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn recommend(&self, params: &AnalysisParameters) -> Result<Recommendation, RecommenderError> {
        self.synthesize(params)
    }
}

// ── Sampling & Metrics ──────────────────────────────────────────────

pub fn default_temperature(analysis: AnalysisType) -> f32 {
    match analysis {
        AnalysisType::Security => 0.1,
        AnalysisType::Architecture => 0.3,
        AnalysisType::Documentation => 0.4,
        AnalysisType::PrReview | AnalysisType::Performance => 0.2,
    }
}

pub fn default_max_tokens(quality: QualityRequirement) -> u32 {
    match quality {
        QualityRequirement::Basic => 2_048,
        QualityRequirement::Good => 4_096,
        QualityRequirement::Excellent => 8_192,
        QualityRequirement::Perfect => 16_384,
    }
}

pub fn selection_for(
    candidate: &ModelCandidate,
    params: &AnalysisParameters,
    suitability: Option<f64>,
) -> ModelSelection {
    ModelSelection {
        provider: candidate.provider.clone(),
        model: candidate.model.clone(),
        temperature: default_temperature(params.analysis_type),
        max_tokens: default_max_tokens(params.quality_requirement),
        top_p: 0.95,
        suitability,
    }
}

/// Rough expectations for a heuristic pick: slower models and bigger
/// repositories mean longer runs.
pub fn estimate_metrics(
    scored: &ScoredCandidate,
    params: &AnalysisParameters,
    success_rate: f64,
) -> ExpectedMetrics {
    let size_factor = match params.repo_size {
        RepoSize::Small => 1.0,
        RepoSize::Medium => 1.5,
        RepoSize::Large => 2.5,
        RepoSize::Enterprise => 4.0,
    };
    let speed = scored.candidate.capabilities.speed;
    ExpectedMetrics {
        latency_ms: (800.0 + (10.0 - speed) * 600.0) * size_factor,
        cost_per_1k: scored.candidate.pricing.average_per_1k(),
        quality_score: scored.capability_score,
        success_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sample_catalog;
    use crate::catalog::InMemoryCatalog;
    use crate::config::ScoringConfig;
    use crate::params::{Complexity, CostSensitivity, Speed};

    fn recommender(catalog: InMemoryCatalog) -> HeuristicRecommender {
        HeuristicRecommender::new(
            Arc::new(catalog),
            SuitabilityScorer::new(ScoringConfig::default()),
            2,
            0.9,
        )
    }

    fn params() -> AnalysisParameters {
        AnalysisParameters::new(
            Speed::Slow,
            Complexity::Complex,
            "java",
            RepoSize::Enterprise,
            CostSensitivity::Low,
            QualityRequirement::Perfect,
            AnalysisType::Security,
        )
    }

    #[tokio::test]
    async fn test_recommends_top_candidate_with_fallbacks() {
        let rec = recommender(sample_catalog()).recommend(&params()).await.unwrap();
        assert_eq!(rec.fallback_models.len(), 2);
        assert_eq!(rec.selected_model.temperature, 0.1);
        assert_eq!(rec.selected_model.max_tokens, 16_384);
        let top = rec.selected_model.suitability.unwrap();
        assert!(rec.fallback_models.iter().all(|f| f.suitability.unwrap() <= top));
        assert_ne!(rec.selected_model.model, "gpt-3.5-turbo");
    }

    #[tokio::test]
    async fn test_empty_catalog_has_no_candidates() {
        let err = recommender(InMemoryCatalog::new(vec![])).recommend(&params()).await.unwrap_err();
        assert!(matches!(err, RecommenderError::NoCandidates));
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let r = recommender(sample_catalog());
        assert_eq!(r.synthesize(&params()).unwrap(), r.synthesize(&params()).unwrap());
    }
}
