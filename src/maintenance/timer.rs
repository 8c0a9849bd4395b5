//! Clock and cancellable periodic tasks on the tokio runtime.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc, Weekday};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock.
pub struct FixedClock(RwLock<DateTime<Utc>>);

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(RwLock::new(at))
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut t) = self.0.write() {
            *t = at;
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        if let Ok(mut t) = self.0.write() {
            *t += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0.read().map(|t| *t).unwrap_or_else(|_| Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Every(Duration),
    /// Top of `hour` (UTC) on `weekday`.
    Weekly { weekday: Weekday, hour: u32 },
}

impl Cadence {
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Cadence::Every(d) => now + ChronoDuration::from_std(d).unwrap_or(ChronoDuration::zero()),
            Cadence::Weekly { weekday, hour } => next_weekly_run(now, weekday, hour),
        }
    }
}

/// Next occurrence of `weekday` at `hour:00` UTC strictly after `now`.
pub fn next_weekly_run(now: DateTime<Utc>, weekday: Weekday, hour: u32) -> DateTime<Utc> {
    let days_ahead = (weekday.num_days_from_monday() + 7 - now.weekday().num_days_from_monday()) % 7;
    let date = now.date_naive() + ChronoDuration::days(days_ahead as i64);
    let Some(at) = date.and_hms_opt(hour.min(23), 0, 0) else {
        return now + ChronoDuration::weeks(1);
    };
    let candidate = Utc.from_utc_datetime(&at);
    if candidate <= now {
        candidate + ChronoDuration::weeks(1)
    } else {
        candidate
    }
}

/// Handle to one periodic task. Cancelling stops future runs; a run that
/// has already started is left to finish.
pub struct ScheduleHandle {
    name: &'static str,
    task: JoinHandle<()>,
    cancelled: Arc<AtomicBool>,
}

impl ScheduleHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
        debug!(task = self.name, "Schedule cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub struct TaskScheduler {
    clock: Arc<dyn Clock>,
}

impl TaskScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Run `job` at every tick of `cadence` until the handle is cancelled.
    /// Each run is spawned as its own task and awaited before the next
    /// tick is computed, so runs never overlap.
    pub fn schedule<F, Fut>(&self, name: &'static str, cadence: Cadence, job: F) -> ScheduleHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let clock = self.clock.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let task = tokio::spawn(async move {
            loop {
                let now = clock.now();
                let next = cadence.next_after(now);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                debug!(task = name, next = %next, "Next run scheduled");
                tokio::time::sleep(wait).await;

                if flag.load(Ordering::SeqCst) {
                    break;
                }
                info!(task = name, "Scheduled run starting");
                // Detached: aborting this loop does not abort the run.
                if let Err(e) = tokio::spawn(job()).await {
                    error!(task = name, error = %e, "Scheduled run failed");
                }
            }
        });

        ScheduleHandle {
            name,
            task,
            cancelled,
        }
    }
}
