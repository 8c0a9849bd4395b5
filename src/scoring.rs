//! Suitability scorer: ranks catalog candidates for a parameter tuple.
//!
//! Capability weights come from two small tables: one keyed by repository
//! size, one by scoring strategy. The capability score is blended with a
//! log-scaled cost score whose weight depends on repository size and cost
//! sensitivity. Pure and deterministic.

use serde::Serialize;
use std::cmp::Ordering;

use crate::catalog::ModelCandidate;
use crate::config::ScoringConfig;
use crate::params::{
    AnalysisParameters, CostSensitivity, QualityRequirement, RepoSize, Speed,
};

/// Weights over `[code_quality, speed, context_window, reasoning, detail_level]`.
type WeightVector = [f64; 5];

// ── Weight Tables ───────────────────────────────────────────────────

const SIZE_WEIGHTS: [(RepoSize, WeightVector); 4] = [
    (RepoSize::Small, [0.25, 0.35, 0.10, 0.15, 0.15]),
    (RepoSize::Medium, [0.30, 0.20, 0.15, 0.20, 0.15]),
    (RepoSize::Large, [0.25, 0.10, 0.30, 0.25, 0.10]),
    (RepoSize::Enterprise, [0.25, 0.05, 0.30, 0.30, 0.10]),
];

/// How a request trades speed against depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringStrategy {
    Performance,
    Balanced,
    Detail,
}

const STRATEGY_WEIGHTS: [(ScoringStrategy, WeightVector); 3] = [
    (ScoringStrategy::Performance, [0.20, 0.50, 0.10, 0.10, 0.10]),
    (ScoringStrategy::Balanced, [0.30, 0.20, 0.15, 0.20, 0.15]),
    (ScoringStrategy::Detail, [0.30, 0.05, 0.15, 0.25, 0.25]),
];

impl ScoringStrategy {
    pub fn for_parameters(params: &AnalysisParameters) -> Self {
        if params.quality_requirement >= QualityRequirement::Excellent
            || params.speed == Speed::Slow
        {
            Self::Detail
        } else if params.speed == Speed::Fast {
            Self::Performance
        } else {
            Self::Balanced
        }
    }

    fn weights(self) -> WeightVector {
        lookup(&STRATEGY_WEIGHTS, self)
    }
}

fn lookup<K: PartialEq + Copy>(table: &[(K, WeightVector)], key: K) -> WeightVector {
    table
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, w)| *w)
        .unwrap_or([0.2; 5])
}

// ── Scorer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    pub candidate: ModelCandidate,
    pub score: f64,
    pub capability_score: f64,
    pub cost_score: f64,
}

#[derive(Debug, Clone)]
pub struct SuitabilityScorer {
    config: ScoringConfig,
}

impl SuitabilityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Score a candidate in `[0, 10]`. Deprecated candidates have no score.
    pub fn score(&self, candidate: &ModelCandidate, params: &AnalysisParameters) -> Option<f64> {
        self.breakdown(candidate, params).map(|s| s.score)
    }

    pub fn breakdown(
        &self,
        candidate: &ModelCandidate,
        params: &AnalysisParameters,
    ) -> Option<ScoredCandidate> {
        if candidate.deprecated {
            return None;
        }
        let capability_score = self.capability_score(candidate, params);
        let cost_score = self.cost_score(candidate.pricing.average_per_1k());
        let cost_weight = self.cost_weight(params.repo_size, params.cost_sensitivity);
        let score = (1.0 - cost_weight) * capability_score + cost_weight * cost_score;

        Some(ScoredCandidate {
            candidate: candidate.clone(),
            score,
            capability_score,
            cost_score,
        })
    }

    /// Rank non-deprecated candidates: best score first, ties by id.
    pub fn rank(&self, candidates: &[ModelCandidate], params: &AnalysisParameters) -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .iter()
            .filter_map(|c| self.breakdown(c, params))
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.candidate.id().cmp(&b.candidate.id()))
        });
        scored
    }

    pub fn capability_weights(&self, params: &AnalysisParameters) -> WeightVector {
        let size = lookup(&SIZE_WEIGHTS, params.repo_size);
        let strategy = ScoringStrategy::for_parameters(params).weights();

        let mut combined = [0.0; 5];
        for i in 0..5 {
            combined[i] = (size[i] + strategy[i]) / 2.0;
        }
        let total: f64 = combined.iter().sum();
        if total > 0.0 {
            for w in combined.iter_mut() {
                *w /= total;
            }
        }
        combined
    }

    fn capability_score(&self, candidate: &ModelCandidate, params: &AnalysisParameters) -> f64 {
        let weights = self.capability_weights(params);
        let ratings = candidate.capabilities.as_array();
        let mut score: f64 = weights.iter().zip(ratings.iter()).map(|(w, r)| w * r).sum();

        let language = params.language.as_str();
        let analysis = params.analysis_type.to_string();
        if candidate
            .tags
            .iter()
            .any(|t| t.eq_ignore_ascii_case(language) || t.eq_ignore_ascii_case(&analysis))
        {
            score += self.config.tag_bonus;
        }
        score.clamp(0.0, 10.0)
    }

    /// `10 - log10(max(floor, avg * scale)) * factor`, clamped to `[0, 10]`.
    pub fn cost_score(&self, average_per_1k: f64) -> f64 {
        let scaled = (average_per_1k * self.config.price_scale).max(self.config.cost_floor);
        (10.0 - scaled.log10() * self.config.cost_log_factor).clamp(0.0, 10.0)
    }

    pub fn cost_weight(&self, size: RepoSize, sensitivity: CostSensitivity) -> f64 {
        let c = &self.config;
        let base = match size {
            RepoSize::Small => c.cost_weight_small,
            RepoSize::Medium => c.cost_weight_medium,
            RepoSize::Large => c.cost_weight_large,
            RepoSize::Enterprise => c.cost_weight_enterprise,
        };
        let multiplier = match sensitivity {
            CostSensitivity::Low => c.sensitivity_low,
            CostSensitivity::Medium => c.sensitivity_medium,
            CostSensitivity::High => c.sensitivity_high,
        };
        (base * multiplier).clamp(0.0, c.max_cost_weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{candidate, sample_catalog};
    use crate::catalog::ModelCatalog;
    use crate::params::{AnalysisType, Complexity};

    fn params(size: RepoSize, sensitivity: CostSensitivity, speed: Speed) -> AnalysisParameters {
        AnalysisParameters::new(
            speed,
            Complexity::Moderate,
            "rust",
            size,
            sensitivity,
            QualityRequirement::Good,
            AnalysisType::PrReview,
        )
    }

    fn scorer() -> SuitabilityScorer {
        SuitabilityScorer::new(ScoringConfig::default())
    }

    #[test]
    fn test_deprecated_not_scored() {
        let mut c = candidate("x", "old", [9.0; 5], 0.001);
        c.deprecated = true;
        let p = params(RepoSize::Small, CostSensitivity::Low, Speed::Fast);
        assert!(scorer().score(&c, &p).is_none());
    }

    #[test]
    fn test_cost_score_curve() {
        let s = scorer();
        // $0.0001/1k => $0.1/1M => floor => 12.5 clamped to 10
        assert_eq!(s.cost_score(0.0001), 10.0);
        // $0.003/1k => $3/1M
        assert!((s.cost_score(0.003) - (10.0 - 3f64.log10() * 2.5)).abs() < 1e-9);
        assert!(s.cost_score(0.075) < s.cost_score(0.003));
        assert!(s.cost_score(1e12) >= 0.0);
    }

    #[test]
    fn test_cost_weight_by_size() {
        let s = scorer();
        assert!((s.cost_weight(RepoSize::Small, CostSensitivity::Medium) - 0.4).abs() < 1e-9);
        assert!((s.cost_weight(RepoSize::Enterprise, CostSensitivity::Medium) - 0.1).abs() < 1e-9);
        assert!(s.cost_weight(RepoSize::Small, CostSensitivity::High) <= 0.8);
    }

    #[test]
    fn test_weights_normalised_and_size_dependent() {
        let s = scorer();
        let small =
            s.capability_weights(&params(RepoSize::Small, CostSensitivity::Medium, Speed::Medium));
        let ent = s.capability_weights(&params(
            RepoSize::Enterprise,
            CostSensitivity::Medium,
            Speed::Medium,
        ));
        assert!((small.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!((ent.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        // speed matters more for small repos, context window for enterprise
        assert!(small[1] > ent[1]);
        assert!(ent[2] > small[2]);
    }

    #[test]
    fn test_score_is_deterministic() {
        let s = scorer();
        let catalog = sample_catalog();
        let p = params(RepoSize::Large, CostSensitivity::Medium, Speed::Slow);
        let ranked = || -> Vec<_> {
            s.rank(&catalog.list_active(), &p)
                .iter()
                .map(|c| (c.candidate.id(), c.score))
                .collect()
        };
        let first = ranked();
        let second = ranked();
        assert_eq!(first, second);
    }

    #[test]
    fn test_tag_bonus_applies() {
        let s = scorer();
        let plain = candidate("x", "plain", [6.0; 5], 0.01);
        let mut tagged = plain.clone();
        tagged.model = "tagged".into();
        tagged.tags = vec!["Rust".into()];
        let p = params(RepoSize::Medium, CostSensitivity::Medium, Speed::Medium);
        assert!(s.score(&tagged, &p).unwrap() > s.score(&plain, &p).unwrap());
    }

    #[test]
    fn test_higher_cost_sensitivity_never_favours_pricier_model() {
        let s = scorer();
        // Comparable capability, the expensive one slightly better.
        let cheap = candidate("x", "cheap", [7.0, 7.0, 7.0, 7.0, 7.0], 0.0005);
        let pricey = candidate("x", "pricey", [7.5, 7.0, 7.5, 7.5, 7.5], 0.03);

        for size in [RepoSize::Small, RepoSize::Medium, RepoSize::Large, RepoSize::Enterprise] {
            for speed in [Speed::Fast, Speed::Medium, Speed::Slow] {
                let sensitivities = [
                    CostSensitivity::Low,
                    CostSensitivity::Medium,
                    CostSensitivity::High,
                ];
                let margins: Vec<f64> = sensitivities
                    .iter()
                    .map(|&sens| {
                        let p = params(size, sens, speed);
                        s.score(&cheap, &p).unwrap() - s.score(&pricey, &p).unwrap()
                    })
                    .collect();
                // The cheap model's advantage grows (or holds) as sensitivity rises.
                assert!(margins[0] <= margins[1] + 1e-12, "{size:?}/{speed:?}: {margins:?}");
                assert!(margins[1] <= margins[2] + 1e-12, "{size:?}/{speed:?}: {margins:?}");
            }
        }
    }

    #[test]
    fn test_small_repo_high_sensitivity_prefers_cheap_fast_model() {
        let s = scorer();
        let catalog = sample_catalog();
        let p = params(RepoSize::Small, CostSensitivity::High, Speed::Fast);
        let ranked = s.rank(&catalog.list_active(), &p);
        assert_eq!(ranked[0].candidate.model, "gemini-flash-lite");
        assert_eq!(ranked.len(), 5);
    }
}
