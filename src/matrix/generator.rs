//! Generation shared by the request path, priority fill and maintenance.
//!
//! `generate` asks the recommender under a timeout, validates the answer
//! against the catalog and falls back to heuristic synthesis on any failure.
//! `refresh` is the same call without the fallback, so maintenance never
//! writes a degraded configuration over a good row.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{ExpectedMetrics, GeneratedConfiguration, ModelSelection};
use crate::catalog::ModelCatalog;
use crate::config::{ResolverConfig, ScoringConfig};
use crate::error::MatrixError;
use crate::params::AnalysisParameters;
use crate::recommender::heuristic::{estimate_metrics, selection_for};
use crate::recommender::{HeuristicRecommender, Recommendation, Recommender};
use crate::scoring::SuitabilityScorer;

/// Provider name used when the catalog has nothing to offer at all.
pub const PLACEHOLDER_PROVIDER: &str = "none";

/// Outcome of one generation.
#[derive(Debug)]
pub enum Generation {
    /// Validated recommender answer.
    Recommended(GeneratedConfiguration),
    /// Heuristic synthesis after the recommender path failed.
    Degraded {
        configuration: GeneratedConfiguration,
        cause: MatrixError,
    },
}

impl Generation {
    pub fn configuration(&self) -> &GeneratedConfiguration {
        match self {
            Self::Recommended(c) => c,
            Self::Degraded { configuration, .. } => configuration,
        }
    }

    pub fn into_configuration(self) -> GeneratedConfiguration {
        match self {
            Self::Recommended(c) => c,
            Self::Degraded { configuration, .. } => configuration,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

pub struct Generator {
    recommender: Arc<dyn Recommender>,
    catalog: Arc<dyn ModelCatalog>,
    scorer: SuitabilityScorer,
    heuristic: HeuristicRecommender,
    config: ResolverConfig,
}

impl Generator {
    pub fn new(
        recommender: Arc<dyn Recommender>,
        catalog: Arc<dyn ModelCatalog>,
        scoring: ScoringConfig,
        config: ResolverConfig,
    ) -> Self {
        let scorer = SuitabilityScorer::new(scoring);
        let heuristic = HeuristicRecommender::new(
            catalog.clone(),
            scorer.clone(),
            config.fallback_count,
            config.heuristic_success_rate,
        );
        Self {
            recommender,
            catalog,
            scorer,
            heuristic,
            config,
        }
    }

    /// Recommender first, heuristic on failure. Never fails.
    pub async fn generate(&self, params: &AnalysisParameters) -> Generation {
        match self.refresh(params).await {
            Ok(configuration) => Generation::Recommended(configuration),
            Err(cause) => {
                warn!(
                    key = %params.key(),
                    recommender = self.recommender.name(),
                    error = %cause,
                    "Recommender path failed, using heuristic"
                );
                let configuration = self.heuristic(params, Some(&cause));
                Generation::Degraded { configuration, cause }
            }
        }
    }

    /// Validated recommender answer or the error that prevented one.
    pub async fn refresh(&self, params: &AnalysisParameters) -> Result<GeneratedConfiguration, MatrixError> {
        let started = Instant::now();
        let timeout = self.config.recommender_timeout();

        let recommendation = match tokio::time::timeout(timeout, self.recommender.recommend(params)).await {
            Ok(Ok(rec)) => rec,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(MatrixError::RecommenderTimeout(timeout)),
        };

        let (selected, fallbacks, metrics) = self.validate(params, recommendation)?;
        info!(
            key = %params.key(),
            model = %selected.id(),
            fallbacks = fallbacks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Configuration generated"
        );
        Ok(stamp(params, selected, fallbacks, metrics, false, None, false))
    }

    /// Deterministic synthesis from the active catalog. `cause` ends up in
    /// the notes when given.
    pub fn heuristic(&self, params: &AnalysisParameters, cause: Option<&MatrixError>) -> GeneratedConfiguration {
        let note = |what: &str| match cause {
            Some(c) => format!("{what} ({c})"),
            None => what.to_string(),
        };

        match self.heuristic.synthesize(params) {
            Ok(rec) => stamp(
                params,
                rec.selected_model,
                rec.fallback_models,
                rec.expected_metrics,
                true,
                Some(note("heuristic selection")),
                false,
            ),
            Err(_) => self.last_resort(params, note("no active candidates")),
        }
    }

    /// Every active candidate is gone. Point at whatever the catalog saw
    /// last and flag the entry for maintenance.
    fn last_resort(&self, params: &AnalysisParameters, note: String) -> GeneratedConfiguration {
        let Some(candidate) = self.catalog.most_recently_active() else {
            warn!(key = %params.key(), "Catalog is empty, returning placeholder selection");
            let selected = ModelSelection {
                provider: PLACEHOLDER_PROVIDER.into(),
                model: PLACEHOLDER_PROVIDER.into(),
                temperature: 0.2,
                max_tokens: 4_096,
                top_p: 0.95,
                suitability: None,
            };
            let metrics = ExpectedMetrics {
                latency_ms: 0.0,
                cost_per_1k: 0.0,
                quality_score: 0.0,
                success_rate: 0.0,
            };
            return stamp(params, selected, vec![], metrics, true, Some(note), true);
        };

        warn!(
            key = %params.key(),
            model = %candidate.id(),
            "All candidates deprecated, using most recently active model"
        );
        // Score as if active so the metrics estimate has something to go on.
        let mut undeprecated = candidate.clone();
        undeprecated.deprecated = false;
        let metrics = match self.scorer.breakdown(&undeprecated, params) {
            Some(scored) => estimate_metrics(&scored, params, self.config.heuristic_success_rate),
            None => ExpectedMetrics {
                latency_ms: 0.0,
                cost_per_1k: candidate.pricing.average_per_1k(),
                quality_score: 0.0,
                success_rate: self.config.heuristic_success_rate,
            },
        };
        let selected = selection_for(&candidate, params, None);
        stamp(params, selected, vec![], metrics, true, Some(note), true)
    }

    /// Drop unknown or deprecated models, promote the best fallback if the
    /// primary went away, score what is left and order fallbacks by score.
    fn validate(
        &self,
        params: &AnalysisParameters,
        rec: Recommendation,
    ) -> Result<(ModelSelection, Vec<ModelSelection>, ExpectedMetrics), MatrixError> {
        let mut seen = HashSet::new();
        let mut primary = None;
        let mut fallbacks = Vec::new();

        let proposed = std::iter::once((true, rec.selected_model))
            .chain(rec.fallback_models.into_iter().map(|f| (false, f)));
        for (is_primary, mut selection) in proposed {
            if !seen.insert(selection.id()) {
                continue;
            }
            let scored = self
                .catalog
                .get(&selection.provider, &selection.model)
                .and_then(|c| self.scorer.breakdown(&c, params));
            let Some(scored) = scored else {
                debug!(model = %selection.id(), "Dropping unknown or deprecated model");
                continue;
            };
            selection.suitability = Some(scored.score);
            if is_primary {
                primary = Some((selection, scored));
            } else {
                fallbacks.push((selection, scored));
            }
        }

        fallbacks.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id().cmp(&b.0.id()))
        });

        if let Some((selection, _)) = primary {
            let fallbacks = fallbacks.into_iter().map(|(s, _)| s).collect();
            return Ok((selection, fallbacks, rec.expected_metrics));
        }

        let mut rest = fallbacks.into_iter();
        let (promoted, scored) = rest.next().ok_or(MatrixError::AllCandidatesDeprecated)?;
        warn!(
            key = %params.key(),
            model = %promoted.id(),
            "Recommended model unavailable, promoted best fallback"
        );
        // The recommender's metrics described the model that was dropped.
        let metrics = estimate_metrics(&scored, params, self.config.heuristic_success_rate);
        Ok((promoted, rest.map(|(s, _)| s).collect(), metrics))
    }
}

fn stamp(
    params: &AnalysisParameters,
    selected_model: ModelSelection,
    fallback_models: Vec<ModelSelection>,
    expected_metrics: ExpectedMetrics,
    degraded: bool,
    notes: Option<String>,
    needs_refresh: bool,
) -> GeneratedConfiguration {
    let now = Utc::now();
    GeneratedConfiguration {
        key: params.key(),
        parameters: params.clone(),
        selected_model,
        expected_metrics,
        fallback_models,
        generated_at: now,
        last_validated_at: now,
        last_used_at: None,
        usage_count: 0,
        degraded,
        notes,
        needs_refresh,
    }
}
