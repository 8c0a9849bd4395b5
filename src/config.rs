//! Matrix configuration: every tunable in one injected object.
//!
//! Loaded from YAML (`MODEL_MATRIX_CONFIG` or `~/.model-matrix/config.yaml`).
//! Every section defaults, so an absent file or a partial file is fine.

use anyhow::{Context, Result};
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MatrixError;
use crate::params::{AnalysisType, RepoSize};

const CONFIG_ENV: &str = "MODEL_MATRIX_CONFIG";
const DATA_DIR_NAME: &str = ".model-matrix";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    pub storage: StorageConfig,
    pub catalog_path: PathBuf,
    pub normalizer: NormalizerConfig,
    pub scoring: ScoringConfig,
    pub resolver: ResolverConfig,
    pub fill: FillConfig,
    pub maintenance: MaintenanceConfig,
    pub recommender: RecommenderConfig,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            storage: StorageConfig {
                db_path: data_dir.join("matrix.db"),
            },
            catalog_path: data_dir.join("catalog.yaml"),
            normalizer: NormalizerConfig::default(),
            scoring: ScoringConfig::default(),
            resolver: ResolverConfig::default(),
            fill: FillConfig::default(),
            maintenance: MaintenanceConfig::default(),
            recommender: RecommenderConfig::default(),
        }
    }
}

impl MatrixConfig {
    /// Resolve the config path from the environment, falling back to the
    /// data directory. A missing file yields defaults.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir().join("config.yaml"));

        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), MatrixError> {
        if self.fill.batch_size == 0 {
            return Err(MatrixError::Config("fill.batch_size must be > 0".into()));
        }
        if self.fill.max_concurrency == 0 {
            return Err(MatrixError::Config("fill.max_concurrency must be > 0".into()));
        }
        if self.maintenance.weekly_hour > 23 {
            return Err(MatrixError::Config("maintenance.weekly_hour must be 0-23".into()));
        }
        if self.maintenance.critical_success_rate > self.maintenance.min_success_rate {
            return Err(MatrixError::Config(
                "maintenance.critical_success_rate must not exceed min_success_rate".into(),
            ));
        }
        if self.maintenance.critical_latency_ms < self.maintenance.max_latency_ms {
            return Err(MatrixError::Config(
                "maintenance.critical_latency_ms must not be below max_latency_ms".into(),
            ));
        }
        if self.scoring.max_cost_weight < 0.0 || self.scoring.max_cost_weight > 1.0 {
            return Err(MatrixError::Config("scoring.max_cost_weight must be in [0, 1]".into()));
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR_NAME)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("matrix.db"),
        }
    }
}

/// Repository-size bucketing thresholds (exclusive upper bounds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub small_max_files: u64,
    pub small_max_lines: u64,
    pub medium_max_files: u64,
    pub medium_max_lines: u64,
    pub large_max_files: u64,
    pub large_max_lines: u64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            small_max_files: 20,
            small_max_lines: 1_000,
            medium_max_files: 100,
            medium_max_lines: 10_000,
            large_max_files: 1_000,
            large_max_lines: 250_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Added to the capability score when a tag matches the language or analysis type.
    pub tag_bonus: f64,
    pub cost_floor: f64,
    /// Multiplier applied to the per-1k price before the log curve.
    pub price_scale: f64,
    pub cost_log_factor: f64,
    pub cost_weight_small: f64,
    pub cost_weight_medium: f64,
    pub cost_weight_large: f64,
    pub cost_weight_enterprise: f64,
    pub sensitivity_low: f64,
    pub sensitivity_medium: f64,
    pub sensitivity_high: f64,
    pub max_cost_weight: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            tag_bonus: 0.5,
            cost_floor: 0.1,
            price_scale: 1000.0,
            cost_log_factor: 2.5,
            cost_weight_small: 0.4,
            cost_weight_medium: 0.3,
            cost_weight_large: 0.2,
            cost_weight_enterprise: 0.1,
            sensitivity_low: 0.5,
            sensitivity_medium: 1.0,
            sensitivity_high: 1.5,
            max_cost_weight: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub recommender_timeout_ms: u64,
    /// How long a follower waits on another caller's in-flight generation.
    pub wait_timeout_ms: u64,
    /// Entries older than this are regenerated on the request path.
    pub request_stale_after_days: i64,
    pub fallback_count: usize,
    /// Success rate assumed for heuristic configurations.
    pub heuristic_success_rate: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            recommender_timeout_ms: 30_000,
            wait_timeout_ms: 45_000,
            request_stale_after_days: 30,
            fallback_count: 2,
            heuristic_success_rate: 0.9,
        }
    }
}

impl ResolverConfig {
    pub fn recommender_timeout(&self) -> Duration {
        Duration::from_millis(self.recommender_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FillConfig {
    pub enabled: bool,
    pub languages: Vec<String>,
    pub analysis_types: Vec<AnalysisType>,
    pub repo_sizes: Vec<RepoSize>,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub max_concurrency: usize,
    pub max_plan_size: usize,
    pub estimated_cost_per_generation_usd: f64,
}

impl Default for FillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            languages: [
                "javascript", "typescript", "python", "java", "go",
                "rust", "csharp", "cpp", "ruby", "php",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            analysis_types: vec![
                AnalysisType::PrReview,
                AnalysisType::Architecture,
                AnalysisType::Security,
            ],
            repo_sizes: vec![RepoSize::Small, RepoSize::Medium, RepoSize::Large],
            batch_size: 10,
            batch_delay_ms: 2_000,
            max_concurrency: 3,
            max_plan_size: 400,
            estimated_cost_per_generation_usd: 0.02,
        }
    }
}

impl FillConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub weekly_weekday: Weekday,
    pub weekly_hour: u32,
    pub staleness_days: i64,
    pub daily_interval_secs: u64,
    pub emergency_interval_secs: u64,
    pub usage_window_days: i64,
    /// Keys with fewer records in the window are not judged.
    pub min_samples: u64,
    pub min_success_rate: f64,
    pub critical_success_rate: f64,
    pub max_latency_ms: f64,
    pub critical_latency_ms: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            weekly_weekday: Weekday::Sun,
            weekly_hour: 3,
            staleness_days: 7,
            daily_interval_secs: 24 * 3600,
            emergency_interval_secs: 3600,
            usage_window_days: 90,
            min_samples: 10,
            min_success_rate: 0.85,
            critical_success_rate: 0.5,
            max_latency_ms: 30_000.0,
            critical_latency_ms: 60_000.0,
        }
    }
}

impl MaintenanceConfig {
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.staleness_days)
    }

    pub fn usage_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.usage_window_days)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommenderConfig {
    /// External reasoning service. Unset means the heuristic recommender.
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the bearer token.
    pub api_key_env: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
fill:
  batch_size: 5
maintenance:
  weekly_weekday: Mon
  weekly_hour: 4
"#;
        let config: MatrixConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.fill.batch_size, 5);
        assert_eq!(config.fill.max_concurrency, 3);
        assert_eq!(config.maintenance.weekly_weekday, Weekday::Mon);
        assert_eq!(config.maintenance.weekly_hour, 4);
        assert_eq!(config.maintenance.staleness_days, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = MatrixConfig::default();
        config.fill.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = MatrixConfig::default();
        config.maintenance.critical_success_rate = 0.95;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shipped_example_parses() {
        let config: MatrixConfig =
            serde_yaml::from_str(include_str!("../config/matrix.yaml")).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.recommender.endpoint.is_none());
        assert_eq!(config.fill.max_plan_size, 400);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "resolver:\n  recommender_timeout_ms: 1500\n").unwrap();

        let config = MatrixConfig::load(&path).unwrap();
        assert_eq!(config.resolver.recommender_timeout(), Duration::from_millis(1500));
    }
}
