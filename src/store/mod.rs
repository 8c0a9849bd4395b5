//! Configuration store: persistent map from key to configuration, plus the
//! append-only usage log.
//!
//! Writes are whole-row upserts keyed by `ConfigKey`; last writer wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::matrix::GeneratedConfiguration;
use crate::params::ConfigKey;
use crate::usage::{UsageAggregate, UsageRecord};

pub mod sqlite;

pub use sqlite::SqliteConfigStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("corrupt row for {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    async fn get(&self, key: &ConfigKey) -> Result<Option<GeneratedConfiguration>, StoreError>;

    /// Whole-row upsert. `usage_count` and `last_used_at` never move backwards.
    async fn put(&self, config: &GeneratedConfiguration) -> Result<(), StoreError>;

    /// Keys whose `last_validated_at` is older than `threshold`, or that are
    /// flagged for refresh. Oldest first.
    async fn list_stale(&self, threshold: chrono::Duration) -> Result<Vec<ConfigKey>, StoreError>;

    async fn list_all(&self) -> Result<Vec<GeneratedConfiguration>, StoreError>;

    /// Append a usage record and bump the entry's counters.
    async fn record_usage(&self, record: &UsageRecord) -> Result<(), StoreError>;

    async fn usage_summary(&self, key: &ConfigKey, since: DateTime<Utc>) -> Result<UsageAggregate, StoreError>;

    /// Aggregates for every key with at least one record since `since`.
    async fn usage_summaries(&self, since: DateTime<Utc>) -> Result<Vec<(ConfigKey, UsageAggregate)>, StoreError>;

    async fn mark_needs_refresh(&self, key: &ConfigKey) -> Result<(), StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    /// SQLite store whose reads or writes can be switched off, and whose
    /// `get` can be slowed down after the row has been read.
    pub(crate) struct FlakyStore {
        pub(crate) inner: SqliteConfigStore,
        pub(crate) fail_reads: AtomicBool,
        pub(crate) fail_writes: AtomicBool,
        pub(crate) read_delay_ms: AtomicU64,
    }

    impl FlakyStore {
        pub(crate) fn new() -> Self {
            Self {
                inner: SqliteConfigStore::open_in_memory().unwrap(),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                read_delay_ms: AtomicU64::new(0),
            }
        }

        fn check(flag: &AtomicBool) -> Result<(), StoreError> {
            if flag.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("disk detached".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ConfigurationStore for FlakyStore {
        async fn get(&self, key: &ConfigKey) -> Result<Option<GeneratedConfiguration>, StoreError> {
            Self::check(&self.fail_reads)?;
            let found = self.inner.get(key).await?;
            let delay = self.read_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(found)
        }
        async fn put(&self, config: &GeneratedConfiguration) -> Result<(), StoreError> {
            Self::check(&self.fail_writes)?;
            self.inner.put(config).await
        }
        async fn list_stale(
            &self,
            threshold: chrono::Duration,
        ) -> Result<Vec<ConfigKey>, StoreError> {
            self.inner.list_stale(threshold).await
        }
        async fn list_all(&self) -> Result<Vec<GeneratedConfiguration>, StoreError> {
            self.inner.list_all().await
        }
        async fn record_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
            Self::check(&self.fail_writes)?;
            self.inner.record_usage(record).await
        }
        async fn usage_summary(
            &self,
            key: &ConfigKey,
            since: DateTime<Utc>,
        ) -> Result<UsageAggregate, StoreError> {
            self.inner.usage_summary(key, since).await
        }
        async fn usage_summaries(
            &self,
            since: DateTime<Utc>,
        ) -> Result<Vec<(ConfigKey, UsageAggregate)>, StoreError> {
            self.inner.usage_summaries(since).await
        }
        async fn mark_needs_refresh(&self, key: &ConfigKey) -> Result<(), StoreError> {
            self.inner.mark_needs_refresh(key).await
        }
        async fn count(&self) -> Result<usize, StoreError> {
            self.inner.count().await
        }
    }
}
