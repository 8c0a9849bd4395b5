//! Background maintenance: keeps stored configurations current.
//!
//! Three periodic tasks:
//! - weekly refresh of stale entries and of entries whose model has left
//!   the active catalog,
//! - daily performance check over the usage log,
//! - hourly emergency refresh of keys with a high-severity issue.
//!
//! A failed refresh leaves the stored row untouched; the key is retried on
//! the next pass.

pub mod timer;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::ModelCatalog;
use crate::config::MaintenanceConfig;
use crate::matrix::{GeneratedConfiguration, Generator};
use crate::params::ConfigKey;
use crate::store::ConfigurationStore;
use crate::usage::{UsageAggregate, UsageTracker};

pub use timer::{Cadence, Clock, FixedClock, ScheduleHandle, SystemClock, TaskScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTask {
    WeeklyRefresh,
    DailyCheck,
    EmergencyCheck,
}

impl MaintenanceTask {
    pub const ALL: [MaintenanceTask; 3] = [
        MaintenanceTask::WeeklyRefresh,
        MaintenanceTask::DailyCheck,
        MaintenanceTask::EmergencyCheck,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::WeeklyRefresh => "weekly_refresh",
            Self::DailyCheck => "daily_check",
            Self::EmergencyCheck => "emergency_check",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Scheduled,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceIssue {
    pub key: ConfigKey,
    pub severity: Severity,
    pub samples: u64,
    pub success_rate: Option<f64>,
    pub mean_latency_ms: Option<f64>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshFailure {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub task: MaintenanceTask,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub refreshed: usize,
    pub failed: usize,
    pub failures: Vec<RefreshFailure>,
    /// Issues found (daily check) or still open (emergency check).
    pub issues: usize,
    pub elapsed: Duration,
}

impl MaintenanceReport {
    fn new(task: MaintenanceTask, started_at: DateTime<Utc>) -> Self {
        Self {
            task,
            run_id: Uuid::new_v4(),
            started_at,
            refreshed: 0,
            failed: 0,
            failures: Vec::new(),
            issues: 0,
            elapsed: Duration::ZERO,
        }
    }

    fn fail(&mut self, key: impl ToString, reason: impl ToString) {
        self.failed += 1;
        self.failures.push(RefreshFailure {
            key: key.to_string(),
            reason: reason.to_string(),
        });
    }
}

pub struct MaintenanceScheduler {
    store: Arc<dyn ConfigurationStore>,
    catalog: Arc<dyn ModelCatalog>,
    generator: Arc<Generator>,
    usage: Arc<UsageTracker>,
    clock: Arc<dyn Clock>,
    timer: TaskScheduler,
    config: MaintenanceConfig,
    states: Mutex<HashMap<MaintenanceTask, TaskState>>,
    issues: RwLock<Vec<PerformanceIssue>>,
    reports: RwLock<HashMap<MaintenanceTask, MaintenanceReport>>,
    handles: Mutex<Vec<ScheduleHandle>>,
    started: AtomicBool,
}

impl MaintenanceScheduler {
    pub fn new(
        store: Arc<dyn ConfigurationStore>,
        catalog: Arc<dyn ModelCatalog>,
        generator: Arc<Generator>,
        usage: Arc<UsageTracker>,
        clock: Arc<dyn Clock>,
        config: MaintenanceConfig,
    ) -> Self {
        let states = MaintenanceTask::ALL.iter().map(|t| (*t, TaskState::Idle)).collect();
        Self {
            store,
            catalog,
            generator,
            usage,
            timer: TaskScheduler::new(clock.clone()),
            clock,
            config,
            states: Mutex::new(states),
            issues: RwLock::new(Vec::new()),
            reports: RwLock::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Register the three schedules. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Maintenance already started");
            return;
        }
        let c = &self.config;
        let schedules = [
            (
                MaintenanceTask::WeeklyRefresh,
                Cadence::Weekly {
                    weekday: c.weekly_weekday,
                    hour: c.weekly_hour,
                },
            ),
            (
                MaintenanceTask::DailyCheck,
                Cadence::Every(Duration::from_secs(c.daily_interval_secs)),
            ),
            (
                MaintenanceTask::EmergencyCheck,
                Cadence::Every(Duration::from_secs(c.emergency_interval_secs)),
            ),
        ];

        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        for (task, cadence) in schedules {
            let weak: Weak<Self> = Arc::downgrade(self);
            let handle = self.timer.schedule(task.name(), cadence, move || {
                let weak = weak.clone();
                async move {
                    if let Some(this) = weak.upgrade() {
                        this.run(task).await;
                    }
                }
            });
            handles.push(handle);
            self.set_state(task, TaskState::Scheduled);
        }
        info!(
            weekly = %format!("{:?} {:02}:00 UTC", c.weekly_weekday, c.weekly_hour),
            daily_secs = c.daily_interval_secs,
            emergency_secs = c.emergency_interval_secs,
            "Maintenance started"
        );
    }

    /// Cancel every schedule. Passes already running finish on their own.
    pub fn stop(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        for handle in handles.drain(..) {
            handle.cancel();
        }
        self.started.store(false, Ordering::SeqCst);
        for task in MaintenanceTask::ALL {
            self.set_state(task, TaskState::Stopped);
        }
        info!("Maintenance stopped");
    }

    pub fn task_state(&self, task: MaintenanceTask) -> TaskState {
        self.states
            .lock()
            .ok()
            .and_then(|s| s.get(&task).copied())
            .unwrap_or(TaskState::Idle)
    }

    pub fn issues(&self) -> Vec<PerformanceIssue> {
        self.issues.read().map(|i| i.clone()).unwrap_or_default()
    }

    pub fn last_report(&self, task: MaintenanceTask) -> Option<MaintenanceReport> {
        self.reports.read().ok()?.get(&task).cloned()
    }

    pub async fn run(&self, task: MaintenanceTask) -> MaintenanceReport {
        match task {
            MaintenanceTask::WeeklyRefresh => self.run_weekly_refresh().await,
            MaintenanceTask::DailyCheck => self.run_daily_check().await,
            MaintenanceTask::EmergencyCheck => self.run_emergency_check().await,
        }
    }

    fn set_state(&self, task: MaintenanceTask, state: TaskState) {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        states.insert(task, state);
    }

    fn begin(&self, task: MaintenanceTask) -> (MaintenanceReport, Instant) {
        self.set_state(task, TaskState::Running);
        (MaintenanceReport::new(task, self.clock.now()), Instant::now())
    }

    fn finish(&self, mut report: MaintenanceReport, started: Instant) -> MaintenanceReport {
        report.elapsed = started.elapsed();
        let task = report.task;
        {
            let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
            // A stop() that landed mid-run wins.
            if states.get(&task) != Some(&TaskState::Stopped) {
                let next = if self.started.load(Ordering::SeqCst) {
                    TaskState::Scheduled
                } else {
                    TaskState::Idle
                };
                states.insert(task, next);
            }
        }
        info!(
            task = task.name(),
            run_id = %report.run_id,
            refreshed = report.refreshed,
            failed = report.failed,
            issues = report.issues,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Maintenance pass complete"
        );
        if let Ok(mut reports) = self.reports.write() {
            reports.insert(task, report.clone());
        }
        report
    }

    // ── Weekly Refresh ──────────────────────────────────────────────

    /// Refresh entries past the staleness window, flagged for refresh,
    /// produced by the heuristic, or pointing at a model the catalog no
    /// longer offers.
    pub async fn run_weekly_refresh(&self) -> MaintenanceReport {
        let (mut report, started) = self.begin(MaintenanceTask::WeeklyRefresh);

        let mut keys = match self.store.list_stale(self.config.staleness_window()).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "Failed to list stale configurations");
                report.fail("*", e);
                return self.finish(report, started);
            }
        };
        match self.store.list_all().await {
            Ok(all) => {
                let mut seen: HashSet<ConfigKey> = keys.iter().cloned().collect();
                for config in all {
                    if (config.degraded || !self.model_is_active(&config)) && seen.insert(config.key.clone()) {
                        keys.push(config.key);
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to scan for deprecated selections"),
        }

        info!(candidates = keys.len(), "Weekly refresh starting");
        self.refresh_keys(&keys, &mut report).await;
        self.finish(report, started)
    }

    fn model_is_active(&self, config: &GeneratedConfiguration) -> bool {
        let m = &config.selected_model;
        self.catalog
            .get(&m.provider, &m.model)
            .map(|c| !c.deprecated)
            .unwrap_or(false)
    }

    /// Regenerate each key in place. Successful keys leave the issue list.
    async fn refresh_keys(&self, keys: &[ConfigKey], report: &mut MaintenanceReport) {
        for key in keys {
            let existing = match self.store.get(key).await {
                Ok(Some(c)) => c,
                Ok(None) => continue,
                Err(e) => {
                    report.fail(key, e);
                    continue;
                }
            };

            let mut fresh = match self.generator.refresh(&existing.parameters).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(key = %key, error = %e, "Refresh failed, keeping existing entry");
                    report.fail(key, e);
                    continue;
                }
            };
            fresh.usage_count = existing.usage_count;
            fresh.last_used_at = existing.last_used_at;

            if let Err(e) = self.store.put(&fresh).await {
                error!(key = %key, error = %e, "Failed to store refreshed configuration");
                report.fail(key, e);
                continue;
            }
            if fresh.selected_model != existing.selected_model {
                info!(
                    key = %key,
                    from = %existing.selected_model.id(),
                    to = %fresh.selected_model.id(),
                    "Selection changed on refresh"
                );
            }
            report.refreshed += 1;
            if let Ok(mut issues) = self.issues.write() {
                issues.retain(|i| &i.key != key);
            }
        }
    }

    // ── Performance Checks ──────────────────────────────────────────

    /// Judge every key with enough recent samples. A key validated inside
    /// the usage window is judged only on records since that validation,
    /// so outcomes of a replaced selection do not count against its
    /// successor. The result replaces the previous issue set; medium issues
    /// are flagged for the next weekly refresh.
    pub async fn run_daily_check(&self) -> MaintenanceReport {
        let (mut report, started) = self.begin(MaintenanceTask::DailyCheck);

        let window = self.config.usage_window();
        let aggregates = match self.usage.aggregate_all(window).await {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "Failed to aggregate usage");
                report.fail("*", e);
                return self.finish(report, started);
            }
        };
        let window_start = Utc::now() - window;
        let validated: HashMap<ConfigKey, DateTime<Utc>> = match self.store.list_all().await {
            Ok(all) => all.into_iter().map(|c| (c.key, c.last_validated_at)).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to read validation times, judging the full window");
                HashMap::new()
            }
        };

        let now = self.clock.now();
        let mut found = Vec::new();
        for (key, agg) in aggregates {
            let agg = match validated.get(&key) {
                Some(&since) if since > window_start => {
                    match self.usage.aggregate_since(&key, since).await {
                        Ok(recent) => recent,
                        Err(e) => {
                            report.fail(&key, e);
                            continue;
                        }
                    }
                }
                _ => agg,
            };
            if let Some(severity) = self.classify(&agg) {
                found.push(PerformanceIssue {
                    key,
                    severity,
                    samples: agg.samples,
                    success_rate: agg.success_rate,
                    mean_latency_ms: agg.mean_latency_ms,
                    detected_at: now,
                });
            }
        }

        for issue in &found {
            warn!(
                key = %issue.key,
                severity = ?issue.severity,
                success_rate = issue.success_rate,
                mean_latency_ms = issue.mean_latency_ms,
                "Performance issue detected"
            );
            if issue.severity == Severity::Medium {
                if let Err(e) = self.store.mark_needs_refresh(&issue.key).await {
                    report.fail(&issue.key, e);
                }
            }
        }

        report.issues = found.len();
        if let Ok(mut issues) = self.issues.write() {
            *issues = found;
        }
        self.finish(report, started)
    }

    fn classify(&self, agg: &UsageAggregate) -> Option<Severity> {
        let c = &self.config;
        if agg.samples < c.min_samples {
            return None;
        }
        let rate = agg.success_rate.unwrap_or(1.0);
        let latency = agg.mean_latency_ms.unwrap_or(0.0);

        if rate < c.critical_success_rate || latency > c.critical_latency_ms {
            Some(Severity::High)
        } else if rate < c.min_success_rate || latency > c.max_latency_ms {
            Some(Severity::Medium)
        } else {
            None
        }
    }

    /// Narrow refresh of high-severity keys only.
    pub async fn run_emergency_check(&self) -> MaintenanceReport {
        let (mut report, started) = self.begin(MaintenanceTask::EmergencyCheck);

        let urgent: Vec<ConfigKey> = self
            .issues()
            .into_iter()
            .filter(|i| i.severity == Severity::High)
            .map(|i| i.key)
            .collect();
        if !urgent.is_empty() {
            warn!(keys = urgent.len(), "Emergency refresh starting");
            self.refresh_keys(&urgent, &mut report).await;
        }

        report.issues = self.issues().len();
        self.finish(report, started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sample_catalog;
    use crate::config::ScoringConfig;
    use crate::matrix::generator::tests::{resolver_config, Mode, StubRecommender};
    use crate::store::sqlite::tests::sample_config;
    use crate::store::SqliteConfigStore;

    struct Harness {
        stub: Arc<StubRecommender>,
        store: Arc<SqliteConfigStore>,
        usage: Arc<UsageTracker>,
        maintenance: Arc<MaintenanceScheduler>,
    }

    fn harness(mode: Mode) -> Harness {
        let catalog: Arc<dyn ModelCatalog> = Arc::new(sample_catalog());
        let stub = Arc::new(StubRecommender::new(catalog.clone(), mode, Duration::ZERO));
        let store = Arc::new(SqliteConfigStore::open_in_memory().unwrap());
        let usage = Arc::new(UsageTracker::new(store.clone()));
        let generator = Arc::new(Generator::new(
            stub.clone(),
            catalog.clone(),
            ScoringConfig::default(),
            resolver_config(1_000),
        ));
        let maintenance = Arc::new(MaintenanceScheduler::new(
            store.clone(),
            catalog,
            generator,
            usage.clone(),
            Arc::new(SystemClock),
            MaintenanceConfig::default(),
        ));
        Harness {
            stub,
            store,
            usage,
            maintenance,
        }
    }

    fn days_ago(days: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::days(days)
    }

    #[tokio::test]
    async fn test_weekly_refresh_only_touches_stale_entries() {
        let h = harness(Mode::Delegate);
        let fresh = sample_config("python", days_ago(1));
        let stale = sample_config("go", days_ago(10));
        h.store.put(&fresh).await.unwrap();
        h.store.put(&stale).await.unwrap();

        let report = h.maintenance.run_weekly_refresh().await;
        assert_eq!(report.refreshed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(h.stub.calls(), 1);

        let row = h.store.get(&stale.key).await.unwrap().unwrap();
        assert!(row.last_validated_at > days_ago(1));
        let untouched = h.store.get(&fresh.key).await.unwrap().unwrap();
        assert_eq!(untouched.last_validated_at, fresh.last_validated_at);
    }

    #[tokio::test]
    async fn test_weekly_refresh_replaces_deprecated_selection() {
        let h = harness(Mode::Delegate);
        let mut config = sample_config("python", days_ago(1));
        config.selected_model.model = "gpt-3.5-turbo".into();
        h.store.put(&config).await.unwrap();

        let report = h.maintenance.run_weekly_refresh().await;
        assert_eq!(report.refreshed, 1);
        let row = h.store.get(&config.key).await.unwrap().unwrap();
        assert_ne!(row.selected_model.model, "gpt-3.5-turbo");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_existing_row() {
        let h = harness(Mode::Fail);
        let stale = sample_config("go", days_ago(10));
        h.store.put(&stale).await.unwrap();

        let report = h.maintenance.run_weekly_refresh().await;
        assert_eq!(report.refreshed, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].key, stale.key.to_string());

        let row = h.store.get(&stale.key).await.unwrap().unwrap();
        assert_eq!(row.last_validated_at, stale.last_validated_at);
        assert!(!row.degraded);

        // Retried and cleared on the next pass once the recommender recovers.
        h.stub.set_mode(Mode::Delegate);
        let report = h.maintenance.run_weekly_refresh().await;
        assert_eq!(report.refreshed, 1);
    }

    #[tokio::test]
    async fn test_scenario_c_failures_trigger_emergency_refresh() {
        let h = harness(Mode::Delegate);
        let config = sample_config("javascript", days_ago(1));
        h.store.put(&config).await.unwrap();
        for _ in 0..20 {
            h.usage.record(&config.key, false, 2_000).await;
        }

        let daily = h.maintenance.run_daily_check().await;
        assert_eq!(daily.issues, 1);
        let issues = h.maintenance.issues();
        assert_eq!(issues[0].key, config.key);
        assert_eq!(issues[0].severity, Severity::High);
        assert_eq!(issues[0].success_rate, Some(0.0));

        let emergency = h.maintenance.run_emergency_check().await;
        assert_eq!(emergency.refreshed, 1);
        assert_eq!(emergency.issues, 0);
        assert_eq!(h.stub.calls(), 1);
        assert!(h.maintenance.issues().is_empty());

        let row = h.store.get(&config.key).await.unwrap().unwrap();
        assert!(row.last_validated_at > config.last_validated_at);
        assert!(h.maintenance.last_report(MaintenanceTask::EmergencyCheck).is_some());

        // Failures recorded before the refresh no longer count.
        let next_day = h.maintenance.run_daily_check().await;
        assert_eq!(next_day.issues, 0);
        assert!(h.maintenance.issues().is_empty());
        assert_eq!(h.maintenance.run_emergency_check().await.refreshed, 0);
        assert_eq!(h.stub.calls(), 1);
    }

    #[tokio::test]
    async fn test_report_serializes_with_run_id() {
        let h = harness(Mode::Delegate);
        let report = h.maintenance.run_daily_check().await;
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["task"], "daily_check");
        assert_eq!(json["run_id"], report.run_id.to_string());
    }

    #[tokio::test]
    async fn test_medium_issue_is_flagged_not_refreshed() {
        let h = harness(Mode::Delegate);
        let config = sample_config("ruby", days_ago(1));
        h.store.put(&config).await.unwrap();
        for i in 0..10 {
            h.usage.record(&config.key, i < 8, 1_000).await;
        }

        h.maintenance.run_daily_check().await;
        let issues = h.maintenance.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Medium);
        assert!(h.store.get(&config.key).await.unwrap().unwrap().needs_refresh);

        let emergency = h.maintenance.run_emergency_check().await;
        assert_eq!(emergency.refreshed, 0);
        assert_eq!(h.stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_slow_keys_flagged_and_small_samples_ignored() {
        let h = harness(Mode::Delegate);
        let slow = sample_config("java", days_ago(1));
        let sparse = sample_config("php", days_ago(1));
        for _ in 0..10 {
            h.usage.record(&slow.key, true, 70_000).await;
        }
        for _ in 0..3 {
            h.usage.record(&sparse.key, false, 1_000).await;
        }

        let report = h.maintenance.run_daily_check().await;
        assert_eq!(report.issues, 1);
        let issues = h.maintenance.issues();
        assert_eq!(issues[0].key, slow.key);
        assert_eq!(issues[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn test_issue_set_is_replaced() {
        let h = harness(Mode::Delegate);
        let config = sample_config("javascript", days_ago(1));
        for _ in 0..20 {
            h.usage.record(&config.key, false, 2_000).await;
        }
        h.maintenance.run_daily_check().await;
        assert_eq!(h.maintenance.issues().len(), 1);

        let quiet = Arc::new(MaintenanceScheduler::new(
            h.store.clone(),
            Arc::new(sample_catalog()),
            Arc::new(Generator::new(
                h.stub.clone(),
                Arc::new(sample_catalog()),
                ScoringConfig::default(),
                resolver_config(1_000),
            )),
            h.usage.clone(),
            Arc::new(SystemClock),
            MaintenanceConfig {
                min_samples: 100,
                ..MaintenanceConfig::default()
            },
        ));
        quiet.run_daily_check().await;
        assert!(quiet.issues().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop_transitions() {
        let h = harness(Mode::Delegate);
        for task in MaintenanceTask::ALL {
            assert_eq!(h.maintenance.task_state(task), TaskState::Idle);
        }

        h.maintenance.start();
        for task in MaintenanceTask::ALL {
            assert_eq!(h.maintenance.task_state(task), TaskState::Scheduled);
        }
        // A manual pass returns to Scheduled while the schedules are live.
        h.maintenance.run_daily_check().await;
        assert_eq!(h.maintenance.task_state(MaintenanceTask::DailyCheck), TaskState::Scheduled);

        h.maintenance.stop();
        for task in MaintenanceTask::ALL {
            assert_eq!(h.maintenance.task_state(task), TaskState::Stopped);
        }
        assert!(h.maintenance.handles.lock().unwrap().is_empty());
    }
}
