//! Matrix resolver: the request-path entry point.
//!
//! Store lookup first. On a miss or a stale entry exactly one caller per key
//! (the leader) runs generation; concurrent callers for the same key wait on
//! a `watch` channel for the leader's result instead of calling the
//! recommender again. Every transient failure ends in a degraded
//! configuration; only invalid parameters reach the caller as an error.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{GeneratedConfiguration, Generation, Generator, Resolution, ResolutionSource};
use crate::config::{NormalizerConfig, ResolverConfig};
use crate::error::{MatrixError, Result};
use crate::params::{normalize, AnalysisParameters, ConfigKey, RawContext};
use crate::store::ConfigurationStore;
use crate::usage::UsageTracker;

/// What a leader publishes to its followers.
#[derive(Debug, Clone)]
struct Published {
    configuration: GeneratedConfiguration,
    degraded: bool,
}

type InFlight = Mutex<HashMap<ConfigKey, watch::Receiver<Option<Published>>>>;

enum Role {
    Leader(watch::Sender<Option<Published>>),
    Follower(watch::Receiver<Option<Published>>),
}

/// Removes the in-flight entry when the leader finishes, fails or is
/// cancelled mid-await. Dropping the sender wakes followers with an error.
struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    key: ConfigKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        map.remove(&self.key);
    }
}

pub struct MatrixResolver {
    store: Arc<dyn ConfigurationStore>,
    generator: Arc<Generator>,
    usage: Arc<UsageTracker>,
    normalizer: NormalizerConfig,
    config: ResolverConfig,
    in_flight: InFlight,
    last_good: RwLock<HashMap<ConfigKey, GeneratedConfiguration>>,
    degraded: AtomicBool,
}

impl MatrixResolver {
    pub fn new(
        store: Arc<dyn ConfigurationStore>,
        generator: Arc<Generator>,
        usage: Arc<UsageTracker>,
        normalizer: NormalizerConfig,
        config: ResolverConfig,
    ) -> Self {
        Self {
            store,
            generator,
            usage,
            normalizer,
            config,
            in_flight: Mutex::new(HashMap::new()),
            last_good: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Normalize a raw context and resolve it. Fails only on invalid input.
    pub async fn resolve(&self, raw: &RawContext) -> Result<Resolution> {
        let (params, _) = normalize(raw, &self.normalizer)?;
        Ok(self.resolve_parameters(params).await)
    }

    pub async fn resolve_parameters(&self, params: AnalysisParameters) -> Resolution {
        let started = Instant::now();
        let key = params.key();

        let existing = match self.store.get(&key).await {
            Ok(found) => found,
            Err(e) => {
                error!(key = %key, error = %e, "Store read failed");
                self.degraded.store(true, Ordering::SeqCst);
                return self.without_store(&params, MatrixError::StoreUnavailable(e));
            }
        };

        if let Some(config) = existing.as_ref().filter(|c| self.is_fresh(c)) {
            self.remember(config);
            let elapsed_ms = started.elapsed().as_millis() as u64;
            self.usage.record(&key, true, elapsed_ms).await;
            debug!(key = %key, model = %config.selected_model.id(), elapsed_ms, "Cache hit");
            return Resolution {
                degraded: config.degraded,
                configuration: config.clone(),
                source: ResolutionSource::Cached,
            };
        }

        match self.join_or_lead(&key) {
            Role::Follower(rx) => self.follow(&params, rx).await,
            Role::Leader(tx) => {
                let _guard = InFlightGuard {
                    in_flight: &self.in_flight,
                    key: key.clone(),
                };
                // A previous leader may have stored a fresh row after our
                // first read and released the key before we got here.
                let existing = match self.store.get(&key).await {
                    Ok(Some(config)) if self.is_fresh(&config) => {
                        return self.adopt(config, tx);
                    }
                    Ok(found) => found,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Store re-read failed, using first read");
                        existing
                    }
                };
                self.lead(&params, existing, tx).await
            }
        }
    }

    /// Feed an analysis outcome back into the usage log.
    pub async fn record_outcome(&self, key: &ConfigKey, success: bool, latency_ms: u64) {
        self.usage.record(key, success, latency_ms).await;
    }

    /// Whether the most recent store interaction failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Request-path freshness is age only. `needs_refresh` belongs to
    /// maintenance and never forces a request to regenerate.
    fn is_fresh(&self, config: &GeneratedConfiguration) -> bool {
        let max_age = chrono::Duration::days(self.config.request_stale_after_days);
        !config.is_expired(Utc::now(), max_age)
    }

    /// Serve a row another leader just stored, and hand it to any followers.
    fn adopt(
        &self,
        configuration: GeneratedConfiguration,
        tx: watch::Sender<Option<Published>>,
    ) -> Resolution {
        debug!(key = %configuration.key, "Joined a generation that finished before ours started");
        self.remember(&configuration);
        let degraded = configuration.degraded;
        let _ = tx.send(Some(Published {
            configuration: configuration.clone(),
            degraded,
        }));
        Resolution {
            configuration,
            degraded,
            source: ResolutionSource::Joined,
        }
    }

    fn join_or_lead(&self, key: &ConfigKey) -> Role {
        let mut map = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(rx) = map.get(key) {
            return Role::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        map.insert(key.clone(), rx);
        Role::Leader(tx)
    }

    async fn lead(
        &self,
        params: &AnalysisParameters,
        existing: Option<GeneratedConfiguration>,
        tx: watch::Sender<Option<Published>>,
    ) -> Resolution {
        let key = params.key();
        let (configuration, source, write) = match self.generator.generate(params).await {
            Generation::Recommended(c) => (c, ResolutionSource::Generated, true),
            Generation::Degraded { configuration, cause } => match existing {
                // Keep serving the old row rather than overwrite it with a guess.
                Some(stale) if !stale.degraded => {
                    warn!(key = %key, error = %cause, "Regeneration failed, serving stale entry");
                    (stale, ResolutionSource::LastGood, false)
                }
                _ => (configuration, ResolutionSource::Heuristic, true),
            },
        };

        let mut degraded = configuration.degraded || source == ResolutionSource::LastGood;
        if write {
            match self.store.put(&configuration).await {
                Ok(()) => self.degraded.store(false, Ordering::SeqCst),
                Err(e) => {
                    error!(key = %key, error = %e, "Store write failed, returning unsaved configuration");
                    self.degraded.store(true, Ordering::SeqCst);
                    degraded = true;
                }
            }
        }
        if !configuration.degraded {
            self.remember(&configuration);
        }

        info!(
            key = %key,
            model = %configuration.selected_model.id(),
            source = ?source,
            degraded,
            "Configuration resolved"
        );
        // Receivers are kept alive by the in-flight map until the guard drops.
        let _ = tx.send(Some(Published {
            configuration: configuration.clone(),
            degraded,
        }));
        Resolution {
            configuration,
            degraded,
            source,
        }
    }

    async fn follow(
        &self,
        params: &AnalysisParameters,
        mut rx: watch::Receiver<Option<Published>>,
    ) -> Resolution {
        let key = params.key();
        let wait = self.config.wait_timeout();
        let published = match tokio::time::timeout(wait, rx.wait_for(|v| v.is_some())).await {
            Ok(Ok(value)) => value.clone(),
            Ok(Err(_)) => {
                warn!(key = %key, "In-flight generation was abandoned");
                None
            }
            Err(_) => {
                warn!(key = %key, wait_ms = wait.as_millis() as u64, "Timed out waiting for in-flight generation");
                None
            }
        };

        match published {
            Some(p) => Resolution {
                configuration: p.configuration,
                degraded: p.degraded,
                source: ResolutionSource::Joined,
            },
            None => Resolution {
                configuration: self.generator.heuristic(params, Some(&MatrixError::RecommenderTimeout(wait))),
                degraded: true,
                source: ResolutionSource::Heuristic,
            },
        }
    }

    /// Store reads are failing: last-good copy if we have one, else heuristic.
    fn without_store(&self, params: &AnalysisParameters, cause: MatrixError) -> Resolution {
        let key = params.key();
        let cached = self
            .last_good
            .read()
            .ok()
            .and_then(|m| m.get(&key).cloned());
        match cached {
            Some(configuration) => {
                warn!(key = %key, "Serving last-good configuration while the store is unavailable");
                Resolution {
                    configuration,
                    degraded: true,
                    source: ResolutionSource::LastGood,
                }
            }
            None => Resolution {
                configuration: self.generator.heuristic(params, Some(&cause)),
                degraded: true,
                source: ResolutionSource::Heuristic,
            },
        }
    }

    fn remember(&self, configuration: &GeneratedConfiguration) {
        if let Ok(mut map) = self.last_good.write() {
            map.insert(configuration.key.clone(), configuration.clone());
        }
    }
}
