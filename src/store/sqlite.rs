//! SQLite-backed configuration store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{ConfigurationStore, StoreError};
use crate::matrix::{ExpectedMetrics, GeneratedConfiguration, ModelSelection};
use crate::params::{AnalysisParameters, ConfigKey};
use crate::usage::{UsageAggregate, UsageRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS configurations (
    config_key TEXT PRIMARY KEY,
    speed TEXT NOT NULL,
    complexity TEXT NOT NULL,
    language TEXT NOT NULL,
    repo_size TEXT NOT NULL,
    cost_sensitivity TEXT NOT NULL,
    quality_requirement TEXT NOT NULL,
    analysis_type TEXT NOT NULL,
    selected_provider TEXT NOT NULL,
    selected_model TEXT NOT NULL,
    temperature REAL NOT NULL,
    max_tokens INTEGER NOT NULL,
    top_p REAL NOT NULL,
    suitability REAL,
    expected_latency_ms REAL NOT NULL,
    expected_cost_per_1k REAL NOT NULL,
    expected_quality REAL NOT NULL,
    expected_success_rate REAL NOT NULL,
    fallback_models TEXT NOT NULL,
    generated_at TEXT NOT NULL,
    last_validated_at TEXT NOT NULL,
    last_used_at TEXT,
    usage_count INTEGER NOT NULL DEFAULT 0,
    degraded BOOLEAN NOT NULL DEFAULT 0,
    notes TEXT,
    needs_refresh BOOLEAN NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_configurations_params ON configurations(
    speed, complexity, language, repo_size, cost_sensitivity, quality_requirement, analysis_type
);
CREATE INDEX IF NOT EXISTS idx_configurations_validated ON configurations(last_validated_at);

CREATE TABLE IF NOT EXISTS usage_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL,
    config_key TEXT NOT NULL,
    success BOOLEAN NOT NULL,
    latency_ms INTEGER NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_usage_log_key_time ON usage_log(config_key, timestamp);
CREATE INDEX IF NOT EXISTS idx_usage_log_time ON usage_log(timestamp);
";

const SELECT_COLUMNS: &str = "config_key, speed, complexity, language, repo_size, cost_sensitivity,
    quality_requirement, analysis_type, selected_provider, selected_model, temperature, max_tokens,
    top_p, suitability, expected_latency_ms, expected_cost_per_1k, expected_quality,
    expected_success_rate, fallback_models, generated_at, last_validated_at, last_used_at,
    usage_count, degraded, notes, needs_refresh";

pub struct SqliteConfigStore {
    db: Mutex<Connection>,
}

impl SqliteConfigStore {
    /// Open (or create) the store at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Connection::open(db_path)?;
        // WAL mode for concurrent reads
        db.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self, StoreError> {
        db.execute_batch(SCHEMA)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// RFC 3339 with fixed precision and `Z`, so text comparison orders correctly.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(key: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("bad timestamp '{raw}': {e}"),
        })
}

fn corrupt(key: &str) -> impl Fn(crate::error::MatrixError) -> StoreError + '_ {
    move |e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

/// Raw column values; converted outside the rusqlite closure so parse
/// failures surface as `StoreError::Corrupt`.
struct StoredRow {
    key: String,
    fields: [String; 7],
    provider: String,
    model: String,
    temperature: f64,
    max_tokens: i64,
    top_p: f64,
    suitability: Option<f64>,
    metrics: [f64; 4],
    fallback_models: String,
    generated_at: String,
    last_validated_at: String,
    last_used_at: Option<String>,
    usage_count: i64,
    degraded: bool,
    notes: Option<String>,
    needs_refresh: bool,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            fields: [
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ],
            provider: row.get(8)?,
            model: row.get(9)?,
            temperature: row.get(10)?,
            max_tokens: row.get(11)?,
            top_p: row.get(12)?,
            suitability: row.get(13)?,
            metrics: [row.get(14)?, row.get(15)?, row.get(16)?, row.get(17)?],
            fallback_models: row.get(18)?,
            generated_at: row.get(19)?,
            last_validated_at: row.get(20)?,
            last_used_at: row.get(21)?,
            usage_count: row.get(22)?,
            degraded: row.get(23)?,
            notes: row.get(24)?,
            needs_refresh: row.get(25)?,
        })
    }

    fn into_configuration(self) -> Result<GeneratedConfiguration, StoreError> {
        let key = self.key.as_str();
        let [speed, complexity, language, repo_size, cost, quality, analysis] = &self.fields;
        let parameters = AnalysisParameters::new(
            speed.parse().map_err(corrupt(key))?,
            complexity.parse().map_err(corrupt(key))?,
            language,
            repo_size.parse().map_err(corrupt(key))?,
            cost.parse().map_err(corrupt(key))?,
            quality.parse().map_err(corrupt(key))?,
            analysis.parse().map_err(corrupt(key))?,
        );
        let fallback_models: Vec<ModelSelection> = serde_json::from_str(&self.fallback_models)
            .map_err(|e| StoreError::Serde(e.to_string()))?;

        Ok(GeneratedConfiguration {
            key: ConfigKey::from_stored(self.key.clone()),
            parameters,
            selected_model: ModelSelection {
                provider: self.provider,
                model: self.model,
                temperature: self.temperature as f32,
                max_tokens: self.max_tokens.max(0) as u32,
                top_p: self.top_p as f32,
                suitability: self.suitability,
            },
            expected_metrics: ExpectedMetrics {
                latency_ms: self.metrics[0],
                cost_per_1k: self.metrics[1],
                quality_score: self.metrics[2],
                success_rate: self.metrics[3],
            },
            fallback_models,
            generated_at: parse_ts(key, &self.generated_at)?,
            last_validated_at: parse_ts(key, &self.last_validated_at)?,
            last_used_at: self
                .last_used_at
                .as_deref()
                .map(|raw| parse_ts(key, raw))
                .transpose()?,
            usage_count: self.usage_count.max(0) as u64,
            degraded: self.degraded,
            notes: self.notes,
            needs_refresh: self.needs_refresh,
        })
    }
}

fn aggregate_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<UsageAggregate> {
    let samples: i64 = row.get(offset)?;
    let successes: Option<i64> = row.get(offset + 1)?;
    let latency_sum: Option<f64> = row.get(offset + 2)?;
    Ok(UsageAggregate::from_counts(
        samples.max(0) as u64,
        successes.unwrap_or(0).max(0) as u64,
        latency_sum.unwrap_or(0.0),
    ))
}

#[async_trait]
impl ConfigurationStore for SqliteConfigStore {
    async fn get(&self, key: &ConfigKey) -> Result<Option<GeneratedConfiguration>, StoreError> {
        let row = {
            let db = self.conn()?;
            db.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM configurations WHERE config_key = ?1"),
                params![key.as_str()],
                StoredRow::from_row,
            )
            .optional()?
        };
        row.map(StoredRow::into_configuration).transpose()
    }

    async fn put(&self, config: &GeneratedConfiguration) -> Result<(), StoreError> {
        let fallback_json = serde_json::to_string(&config.fallback_models)
            .map_err(|e| StoreError::Serde(e.to_string()))?;
        let p = &config.parameters;
        let s = &config.selected_model;
        let m = &config.expected_metrics;

        let db = self.conn()?;
        db.execute(
            "INSERT INTO configurations (
                config_key, speed, complexity, language, repo_size, cost_sensitivity,
                quality_requirement, analysis_type, selected_provider, selected_model,
                temperature, max_tokens, top_p, suitability, expected_latency_ms,
                expected_cost_per_1k, expected_quality, expected_success_rate, fallback_models,
                generated_at, last_validated_at, last_used_at, usage_count, degraded, notes,
                needs_refresh
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                       ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
             ON CONFLICT(config_key) DO UPDATE SET
                selected_provider = excluded.selected_provider,
                selected_model = excluded.selected_model,
                temperature = excluded.temperature,
                max_tokens = excluded.max_tokens,
                top_p = excluded.top_p,
                suitability = excluded.suitability,
                expected_latency_ms = excluded.expected_latency_ms,
                expected_cost_per_1k = excluded.expected_cost_per_1k,
                expected_quality = excluded.expected_quality,
                expected_success_rate = excluded.expected_success_rate,
                fallback_models = excluded.fallback_models,
                generated_at = excluded.generated_at,
                last_validated_at = excluded.last_validated_at,
                last_used_at = CASE
                    WHEN configurations.last_used_at IS NULL THEN excluded.last_used_at
                    WHEN excluded.last_used_at IS NULL THEN configurations.last_used_at
                    WHEN excluded.last_used_at > configurations.last_used_at THEN excluded.last_used_at
                    ELSE configurations.last_used_at
                END,
                usage_count = MAX(configurations.usage_count, excluded.usage_count),
                degraded = excluded.degraded,
                notes = excluded.notes,
                needs_refresh = excluded.needs_refresh",
            params![
                config.key.as_str(),
                p.speed.to_string(),
                p.complexity.to_string(),
                p.language,
                p.repo_size.to_string(),
                p.cost_sensitivity.to_string(),
                p.quality_requirement.to_string(),
                p.analysis_type.to_string(),
                s.provider,
                s.model,
                s.temperature as f64,
                s.max_tokens as i64,
                s.top_p as f64,
                s.suitability,
                m.latency_ms,
                m.cost_per_1k,
                m.quality_score,
                m.success_rate,
                fallback_json,
                ts(config.generated_at),
                ts(config.last_validated_at),
                config.last_used_at.map(ts),
                config.usage_count as i64,
                config.degraded,
                config.notes,
                config.needs_refresh,
            ],
        )?;
        Ok(())
    }

    async fn list_stale(&self, threshold: chrono::Duration) -> Result<Vec<ConfigKey>, StoreError> {
        let cutoff = ts(Utc::now() - threshold);
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT config_key FROM configurations
             WHERE last_validated_at < ?1 OR needs_refresh = 1
             ORDER BY last_validated_at ASC, config_key ASC",
        )?;
        let keys = stmt
            .query_map(params![cutoff], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys.into_iter().map(ConfigKey::from_stored).collect())
    }

    async fn list_all(&self) -> Result<Vec<GeneratedConfiguration>, StoreError> {
        let rows = {
            let db = self.conn()?;
            let mut stmt = db.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM configurations ORDER BY config_key"
            ))?;
            let rows = stmt
                .query_map([], StoredRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(StoredRow::into_configuration).collect()
    }

    async fn record_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let at = ts(record.timestamp);
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO usage_log (record_id, config_key, success, latency_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                record.key.as_str(),
                record.success,
                record.latency_ms as i64,
                at,
            ],
        )?;
        tx.execute(
            "UPDATE configurations
             SET usage_count = usage_count + 1,
                 last_used_at = CASE
                    WHEN last_used_at IS NULL OR last_used_at < ?1 THEN ?1
                    ELSE last_used_at
                 END
             WHERE config_key = ?2",
            params![at, record.key.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn usage_summary(&self, key: &ConfigKey, since: DateTime<Utc>) -> Result<UsageAggregate, StoreError> {
        let db = self.conn()?;
        let aggregate = db.query_row(
            "SELECT COUNT(*),
                    SUM(CASE WHEN success THEN 1 ELSE 0 END),
                    SUM(latency_ms)
             FROM usage_log
             WHERE config_key = ?1 AND timestamp >= ?2",
            params![key.as_str(), ts(since)],
            |row| aggregate_from_row(row, 0),
        )?;
        Ok(aggregate)
    }

    async fn usage_summaries(&self, since: DateTime<Utc>) -> Result<Vec<(ConfigKey, UsageAggregate)>, StoreError> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT config_key,
                    COUNT(*),
                    SUM(CASE WHEN success THEN 1 ELSE 0 END),
                    SUM(latency_ms)
             FROM usage_log
             WHERE timestamp >= ?1
             GROUP BY config_key
             ORDER BY config_key",
        )?;
        let rows = stmt
            .query_map(params![ts(since)], |row| {
                Ok((
                    ConfigKey::from_stored(row.get::<_, String>(0)?),
                    aggregate_from_row(row, 1)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn mark_needs_refresh(&self, key: &ConfigKey) -> Result<(), StoreError> {
        let db = self.conn()?;
        db.execute(
            "UPDATE configurations SET needs_refresh = 1 WHERE config_key = ?1",
            params![key.as_str()],
        )?;
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let db = self.conn()?;
        let n: i64 = db.query_row("SELECT COUNT(*) FROM configurations", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }
}
