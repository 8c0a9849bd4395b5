//! Model matrix daemon.
//!
//! Opens the configuration store, loads the model catalog, pre-fills the
//! high-value configurations and keeps them current in the background
//! until interrupted.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use model_matrix::catalog::{InMemoryCatalog, ModelCatalog};
use model_matrix::config::MatrixConfig;
use model_matrix::maintenance::{MaintenanceScheduler, SystemClock};
use model_matrix::matrix::{Generator, PriorityFillPlanner};
use model_matrix::recommender::{HeuristicRecommender, HttpRecommender, Recommender};
use model_matrix::scoring::SuitabilityScorer;
use model_matrix::store::{ConfigurationStore, SqliteConfigStore};
use model_matrix::usage::UsageTracker;

const LOG_FORMAT_ENV: &str = "MODEL_MATRIX_LOG_FORMAT";

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "model_matrix=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if std::env::var(LOG_FORMAT_ENV).map(|v| v == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("🧮 Model Matrix v{}", env!("CARGO_PKG_VERSION"));

    let config = MatrixConfig::from_env().context("Failed to load configuration")?;

    // ── Store ───────────────────────────────────────────────────────
    let store: Arc<dyn ConfigurationStore> = Arc::new(
        SqliteConfigStore::open(&config.storage.db_path).context("Failed to open configuration store")?,
    );
    let existing = store.count().await.unwrap_or(0);
    info!(
        db = %config.storage.db_path.display(),
        configurations = existing,
        "📦 Store ready"
    );

    // ── Catalog ─────────────────────────────────────────────────────
    let catalog: Arc<dyn ModelCatalog> = Arc::new(
        InMemoryCatalog::from_yaml_file(&config.catalog_path).context("Failed to load model catalog")?,
    );
    let active = catalog.list_active().len();
    if active == 0 {
        warn!("Catalog has no active models, every configuration will be degraded");
    }

    // ── Recommender ─────────────────────────────────────────────────
    let recommender: Arc<dyn Recommender> = match &config.recommender.endpoint {
        Some(endpoint) => {
            let api_key = config
                .recommender
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok());
            info!(endpoint = %endpoint, "Using external recommender");
            Arc::new(
                HttpRecommender::new(endpoint.clone(), api_key, config.resolver.recommender_timeout())
                    .context("Failed to build recommender client")?,
            )
        }
        None => {
            info!("No recommender endpoint configured, using heuristic selection");
            Arc::new(HeuristicRecommender::new(
                catalog.clone(),
                SuitabilityScorer::new(config.scoring.clone()),
                config.resolver.fallback_count,
                config.resolver.heuristic_success_rate,
            ))
        }
    };

    let generator = Arc::new(Generator::new(
        recommender,
        catalog.clone(),
        config.scoring.clone(),
        config.resolver.clone(),
    ));
    let usage = Arc::new(UsageTracker::new(store.clone()));

    // ── Priority Fill ───────────────────────────────────────────────
    if config.fill.enabled {
        let planner = PriorityFillPlanner::new(store.clone(), generator.clone(), config.fill.clone());
        let summary = planner.run().await;
        info!(
            succeeded = summary.succeeded,
            degraded = summary.degraded,
            failed = summary.failed,
            skipped = summary.skipped,
            "🌱 Priority fill done"
        );
    }

    // ── Maintenance ─────────────────────────────────────────────────
    let maintenance = Arc::new(MaintenanceScheduler::new(
        store,
        catalog,
        generator,
        usage,
        Arc::new(SystemClock),
        config.maintenance.clone(),
    ));
    maintenance.start();

    info!("✅ Model Matrix running (Ctrl-C to stop)");
    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;

    info!("Shutting down...");
    maintenance.stop();
    Ok(())
}
