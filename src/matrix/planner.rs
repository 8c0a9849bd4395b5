//! Priority fill: pre-populate the high-value corner of the matrix.
//!
//! The plan is the cross product of popular languages, common analysis
//! types, three user profiles and the usual repository sizes. Generation
//! runs in batches with bounded concurrency and a pause between batches so
//! a cold start does not flood the recommender.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::Generator;
use crate::config::FillConfig;
use crate::params::{
    AnalysisParameters, AnalysisType, Complexity, CostSensitivity, QualityRequirement, RepoSize,
    Speed,
};
use crate::store::ConfigurationStore;

/// A class of user and the request shape it typically sends.
#[derive(Debug, Clone, Copy)]
pub struct UserProfile {
    pub name: &'static str,
    pub speed: Speed,
    pub cost_sensitivity: CostSensitivity,
    pub quality: QualityRequirement,
}

pub const PROFILES: [UserProfile; 3] = [
    UserProfile {
        name: "free/basic",
        speed: Speed::Fast,
        cost_sensitivity: CostSensitivity::High,
        quality: QualityRequirement::Basic,
    },
    UserProfile {
        name: "pro/balanced",
        speed: Speed::Medium,
        cost_sensitivity: CostSensitivity::Medium,
        quality: QualityRequirement::Good,
    },
    UserProfile {
        name: "enterprise/thorough",
        speed: Speed::Slow,
        cost_sensitivity: CostSensitivity::Low,
        quality: QualityRequirement::Excellent,
    },
];

/// Typical complexity for an analysis type on a repository of a given size.
pub fn complexity_for(analysis: AnalysisType, size: RepoSize) -> Complexity {
    match analysis {
        AnalysisType::Architecture | AnalysisType::Security | AnalysisType::Performance => {
            if size >= RepoSize::Large {
                Complexity::Complex
            } else {
                Complexity::Moderate
            }
        }
        AnalysisType::PrReview | AnalysisType::Documentation => {
            if size == RepoSize::Small {
                Complexity::Simple
            } else {
                Complexity::Moderate
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FillFailure {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FillSummary {
    pub planned: usize,
    pub skipped: usize,
    pub succeeded: usize,
    /// Stored from the heuristic path after a recommender failure.
    pub degraded: usize,
    pub failed: usize,
    pub failures: Vec<FillFailure>,
    pub elapsed: Duration,
    pub estimated_cost_usd: f64,
}

pub struct PriorityFillPlanner {
    store: Arc<dyn ConfigurationStore>,
    generator: Arc<Generator>,
    config: FillConfig,
}

impl PriorityFillPlanner {
    pub fn new(store: Arc<dyn ConfigurationStore>, generator: Arc<Generator>, config: FillConfig) -> Self {
        Self {
            store,
            generator,
            config,
        }
    }

    /// Deterministic, deduplicated, capped priority list. Earlier
    /// languages and analysis types in the config rank higher.
    pub fn plan(&self) -> Vec<AnalysisParameters> {
        let mut seen = HashSet::new();
        let mut plan = Vec::new();

        'outer: for language in &self.config.languages {
            for &analysis in &self.config.analysis_types {
                for profile in &PROFILES {
                    for &size in &self.config.repo_sizes {
                        let params = AnalysisParameters::new(
                            profile.speed,
                            complexity_for(analysis, size),
                            language,
                            size,
                            profile.cost_sensitivity,
                            profile.quality,
                            analysis,
                        );
                        if params.language.is_empty() || !seen.insert(params.key()) {
                            continue;
                        }
                        plan.push(params);
                        if plan.len() >= self.config.max_plan_size {
                            break 'outer;
                        }
                    }
                }
            }
        }
        plan
    }

    /// Plan and fill, skipping keys already stored.
    pub async fn run(&self) -> FillSummary {
        self.fill(self.plan(), false).await
    }

    pub async fn fill(&self, plan: Vec<AnalysisParameters>, force: bool) -> FillSummary {
        let started = Instant::now();
        let mut summary = FillSummary {
            planned: plan.len(),
            ..FillSummary::default()
        };

        let mut pending = Vec::with_capacity(plan.len());
        for params in plan {
            if !force {
                match self.store.get(&params.key()).await {
                    Ok(Some(_)) => {
                        summary.skipped += 1;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(key = %params.key(), error = %e, "Store lookup failed, generating anyway"),
                }
            }
            pending.push(params);
        }

        let batch_size = self.config.batch_size.max(1);
        let batches = pending.len().div_ceil(batch_size);
        info!(
            planned = summary.planned,
            skipped = summary.skipped,
            pending = pending.len(),
            batches,
            "Priority fill starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        for (i, batch) in pending.chunks(batch_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.batch_delay()).await;
            }

            let mut set = JoinSet::new();
            for params in batch.iter().cloned() {
                let semaphore = semaphore.clone();
                let generator = self.generator.clone();
                let store = self.store.clone();
                set.spawn(async move {
                    let key = params.key().to_string();
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| FillFailure { key: key.clone(), reason: e.to_string() })?;
                    let generation = generator.generate(&params).await;
                    store
                        .put(generation.configuration())
                        .await
                        .map_err(|e| FillFailure { key, reason: e.to_string() })?;
                    Ok::<_, FillFailure>(generation.is_degraded())
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(false)) => summary.succeeded += 1,
                    Ok(Ok(true)) => summary.degraded += 1,
                    Ok(Err(failure)) => {
                        warn!(key = %failure.key, reason = %failure.reason, "Priority fill item failed");
                        summary.failed += 1;
                        summary.failures.push(failure);
                    }
                    Err(e) => {
                        summary.failed += 1;
                        summary.failures.push(FillFailure {
                            key: "unknown".into(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
            info!(batch = i + 1, of = batches, "Priority fill batch done");
        }

        let generated = summary.succeeded + summary.degraded + summary.failed;
        summary.estimated_cost_usd = generated as f64 * self.config.estimated_cost_per_generation_usd;
        summary.elapsed = started.elapsed();
        info!(
            succeeded = summary.succeeded,
            degraded = summary.degraded,
            failed = summary.failed,
            skipped = summary.skipped,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            estimated_cost_usd = summary.estimated_cost_usd,
            "Priority fill complete"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sample_catalog;
    use crate::catalog::ModelCatalog;
    use crate::matrix::generator::tests::{generator, Mode, StubRecommender};
    use crate::store::tests::FlakyStore;
    use std::sync::atomic::Ordering;

    fn small_config() -> FillConfig {
        FillConfig {
            languages: vec!["python".into(), "rust".into()],
            analysis_types: vec![AnalysisType::PrReview, AnalysisType::Security],
            repo_sizes: vec![RepoSize::Small, RepoSize::Large],
            batch_size: 5,
            batch_delay_ms: 10,
            max_concurrency: 2,
            ..FillConfig::default()
        }
    }

    fn setup(
        mode: Mode,
        delay_ms: u64,
        config: FillConfig,
    ) -> (Arc<StubRecommender>, Arc<FlakyStore>, PriorityFillPlanner) {
        let catalog: Arc<dyn ModelCatalog> = Arc::new(sample_catalog());
        let stub = Arc::new(StubRecommender::new(
            catalog.clone(),
            mode,
            Duration::from_millis(delay_ms),
        ));
        let store = Arc::new(FlakyStore::new());
        let gen = Arc::new(generator(stub.clone(), catalog, 1_000));
        let planner = PriorityFillPlanner::new(store.clone(), gen, config);
        (stub, store, planner)
    }

    #[test]
    fn test_default_plan_is_deduplicated_and_deterministic() {
        let (_, _, planner) = setup(Mode::Delegate, 0, FillConfig::default());
        let plan = planner.plan();
        // 10 languages x 3 analysis types x 3 profiles x 3 sizes
        assert_eq!(plan.len(), 270);
        let keys: HashSet<_> = plan.iter().map(|p| p.key()).collect();
        assert_eq!(keys.len(), plan.len());
        assert_eq!(plan, planner.plan());

        let first = &plan[0];
        assert_eq!(first.language, "javascript");
        assert_eq!(first.analysis_type, AnalysisType::PrReview);
        assert_eq!(first.speed, Speed::Fast);
        assert_eq!(first.repo_size, RepoSize::Small);
    }

    #[test]
    fn test_plan_is_capped() {
        let config = FillConfig {
            max_plan_size: 7,
            ..FillConfig::default()
        };
        let (_, _, planner) = setup(Mode::Delegate, 0, config);
        assert_eq!(planner.plan().len(), 7);
    }

    #[test]
    fn test_duplicate_languages_collapse() {
        let config = FillConfig {
            languages: vec!["Go".into(), "go".into(), " ".into()],
            ..small_config()
        };
        let (_, _, planner) = setup(Mode::Delegate, 0, config);
        assert_eq!(planner.plan().len(), 2 * 3 * 2);
    }

    #[test]
    fn test_complexity_derivation() {
        assert_eq!(complexity_for(AnalysisType::PrReview, RepoSize::Small), Complexity::Simple);
        assert_eq!(complexity_for(AnalysisType::PrReview, RepoSize::Large), Complexity::Moderate);
        assert_eq!(complexity_for(AnalysisType::Security, RepoSize::Medium), Complexity::Moderate);
        assert_eq!(
            complexity_for(AnalysisType::Architecture, RepoSize::Enterprise),
            Complexity::Complex
        );
    }

    #[tokio::test]
    async fn test_fill_generates_and_skips_existing() {
        let (stub, store, planner) = setup(Mode::Delegate, 0, small_config());
        let summary = planner.run().await;
        assert_eq!(summary.planned, 24);
        assert_eq!(summary.succeeded, 24);
        assert_eq!(summary.failed, 0);
        assert_eq!(store.count().await.unwrap(), 24);
        assert!((summary.estimated_cost_usd - 24.0 * 0.02).abs() < 1e-9);

        let again = planner.run().await;
        assert_eq!(again.skipped, 24);
        assert_eq!(again.succeeded, 0);
        assert_eq!(stub.calls(), 24);

        let forced = planner.fill(planner.plan(), true).await;
        assert_eq!(forced.succeeded, 24);
        assert_eq!(stub.calls(), 48);
    }

    #[tokio::test]
    async fn test_fill_respects_concurrency_limit() {
        let (stub, _, planner) = setup(Mode::Delegate, 20, small_config());
        let summary = planner.run().await;
        assert_eq!(summary.succeeded, 24);
        assert!(stub.peak_concurrency() <= 2, "peak was {}", stub.peak_concurrency());
    }

    #[tokio::test]
    async fn test_fill_counts_degraded_generations() {
        let (_, store, planner) = setup(Mode::Fail, 0, small_config());
        let summary = planner.run().await;
        assert_eq!(summary.degraded, 24);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(store.count().await.unwrap(), 24);
    }

    #[tokio::test]
    async fn test_write_failures_do_not_abort_fill() {
        let (_, store, planner) = setup(Mode::Delegate, 0, small_config());
        store.fail_writes.store(true, Ordering::SeqCst);
        let summary = planner.run().await;
        assert_eq!(summary.failed, 24);
        assert_eq!(summary.failures.len(), 24);
        assert!(summary.failures[0].reason.contains("unavailable"));
    }
}
