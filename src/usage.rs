//! Usage tracker: per-key success/failure/latency records.
//!
//! Records are append-only and live in the store's usage log. Aggregation
//! is over a trailing window, and an empty window yields `None` rates
//! rather than a division by zero.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::params::ConfigKey;
use crate::store::{ConfigurationStore, StoreError};

/// Default trailing window for aggregation.
pub const DEFAULT_WINDOW_DAYS: i64 = 90;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub key: ConfigKey,
    pub success: bool,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(key: ConfigKey, success: bool, latency_ms: u64) -> Self {
        Self {
            key,
            success,
            latency_ms,
            timestamp: Utc::now(),
        }
    }
}

/// Rolling aggregate for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageAggregate {
    pub samples: u64,
    pub successes: u64,
    pub success_rate: Option<f64>,
    pub mean_latency_ms: Option<f64>,
}

impl UsageAggregate {
    pub fn from_counts(samples: u64, successes: u64, latency_sum_ms: f64) -> Self {
        if samples == 0 {
            return Self::default();
        }
        Self {
            samples,
            successes,
            success_rate: Some(successes as f64 / samples as f64),
            mean_latency_ms: Some(latency_sum_ms / samples as f64),
        }
    }

    pub fn failures(&self) -> u64 {
        self.samples.saturating_sub(self.successes)
    }
}

pub struct UsageTracker {
    store: Arc<dyn ConfigurationStore>,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn ConfigurationStore>) -> Self {
        Self { store }
    }

    /// Append a record. Failures are logged, never propagated: losing a
    /// usage sample must not fail a request.
    pub async fn record(&self, key: &ConfigKey, success: bool, latency_ms: u64) {
        let record = UsageRecord::new(key.clone(), success, latency_ms);
        if let Err(e) = self.store.record_usage(&record).await {
            warn!(key = %key, error = %e, "Failed to record usage");
        }
    }

    pub async fn aggregate(&self, key: &ConfigKey, window: chrono::Duration) -> Result<UsageAggregate, StoreError> {
        self.store.usage_summary(key, Utc::now() - window).await
    }

    pub async fn aggregate_since(
        &self,
        key: &ConfigKey,
        since: DateTime<Utc>,
    ) -> Result<UsageAggregate, StoreError> {
        self.store.usage_summary(key, since).await
    }

    /// Aggregates for every key with records inside the window.
    pub async fn aggregate_all(&self, window: chrono::Duration) -> Result<Vec<(ConfigKey, UsageAggregate)>, StoreError> {
        self.store.usage_summaries(Utc::now() - window).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{
        AnalysisParameters, AnalysisType, Complexity, CostSensitivity, QualityRequirement,
        RepoSize, Speed,
    };
    use crate::store::SqliteConfigStore;

    fn key() -> ConfigKey {
        AnalysisParameters::new(
            Speed::Medium,
            Complexity::Moderate,
            "go",
            RepoSize::Medium,
            CostSensitivity::Medium,
            QualityRequirement::Good,
            AnalysisType::Security,
        )
        .key()
    }

    fn tracker() -> UsageTracker {
        UsageTracker::new(Arc::new(SqliteConfigStore::open_in_memory().unwrap()))
    }

    #[test]
    fn test_empty_aggregate_is_neutral() {
        let agg = UsageAggregate::from_counts(0, 0, 0.0);
        assert_eq!(agg.success_rate, None);
        assert_eq!(agg.mean_latency_ms, None);
        assert_eq!(agg.failures(), 0);
    }

    #[tokio::test]
    async fn test_aggregate_with_no_records() {
        let agg = tracker()
            .aggregate(&key(), chrono::Duration::days(DEFAULT_WINDOW_DAYS))
            .await
            .unwrap();
        assert_eq!(agg.samples, 0);
        assert!(agg.success_rate.is_none());
    }

    #[tokio::test]
    async fn test_rolling_rates() {
        let tracker = tracker();
        let k = key();
        tracker.record(&k, true, 1_000).await;
        tracker.record(&k, true, 2_000).await;
        tracker.record(&k, false, 6_000).await;
        tracker.record(&k, true, 3_000).await;

        let agg = tracker.aggregate(&k, chrono::Duration::days(1)).await.unwrap();
        assert_eq!(agg.samples, 4);
        assert_eq!(agg.failures(), 1);
        assert_eq!(agg.success_rate, Some(0.75));
        assert_eq!(agg.mean_latency_ms, Some(3_000.0));

        let all = tracker.aggregate_all(chrono::Duration::days(1)).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, k);
    }
}
