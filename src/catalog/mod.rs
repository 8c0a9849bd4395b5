//! Model catalog: candidate models with capability ratings and pricing.
//!
//! The catalog is fed externally (a versioned YAML file at startup, then
//! `apply_update` from whatever feed the deployment runs). The matrix only
//! reads it. Deprecation is one-way: once a `(provider, model)` pair is
//! deprecated, later updates cannot re-activate it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{info, warn};

// ── Candidate ───────────────────────────────────────────────────────

/// Capability ratings, each on a 0-10 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub code_quality: f64,
    pub speed: f64,
    pub context_window: f64,
    pub reasoning: f64,
    pub detail_level: f64,
}

impl Capabilities {
    /// Ratings in the fixed order the scorer's weight vectors use.
    pub fn as_array(&self) -> [f64; 5] {
        [
            self.code_quality,
            self.speed,
            self.context_window,
            self.reasoning,
            self.detail_level,
        ]
    }

    fn clamped(self) -> Self {
        let c = |v: f64| if v.is_finite() { v.clamp(0.0, 10.0) } else { 0.0 };
        Self {
            code_quality: c(self.code_quality),
            speed: c(self.speed),
            context_window: c(self.context_window),
            reasoning: c(self.reasoning),
            detail_level: c(self.detail_level),
        }
    }
}

/// USD per 1k tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Pricing {
    pub fn average_per_1k(&self) -> f64 {
        (self.input_per_1k + self.output_per_1k) / 2.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCandidate {
    pub provider: String,
    pub model: String,
    pub capabilities: Capabilities,
    pub pricing: Pricing,
    #[serde(default)]
    pub deprecated: bool,
    /// Contexts the model is preferred for (languages or analysis types).
    #[serde(default)]
    pub tags: Vec<String>,
    /// When the feed last reported the model active.
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

impl ModelCandidate {
    /// `provider/model`, the catalog identity.
    pub fn id(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

// ── Catalog Trait ───────────────────────────────────────────────────

pub trait ModelCatalog: Send + Sync {
    /// Non-deprecated candidates, sorted by `provider/model`.
    fn list_active(&self) -> Vec<ModelCandidate>;

    fn get(&self, provider: &str, model: &str) -> Option<ModelCandidate>;

    /// The entry with the latest `last_seen`, deprecated or not. Used when
    /// nothing active is left to recommend.
    fn most_recently_active(&self) -> Option<ModelCandidate>;
}

// ── In-Memory Catalog ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    version: Option<String>,
    models: Vec<ModelCandidate>,
}

pub struct InMemoryCatalog {
    models: RwLock<BTreeMap<(String, String), ModelCandidate>>,
    version: RwLock<Option<String>>,
}

impl InMemoryCatalog {
    pub fn new(models: Vec<ModelCandidate>) -> Self {
        let catalog = Self {
            models: RwLock::new(BTreeMap::new()),
            version: RwLock::new(None),
        };
        catalog.apply_update(models);
        catalog
    }

    /// Load a versioned catalog file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        Self::from_yaml_str(&raw)
            .with_context(|| format!("Failed to parse catalog {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(raw)?;
        let catalog = Self::new(file.models);
        info!(
            version = file.version.as_deref().unwrap_or("unversioned"),
            models = catalog.len(),
            "Model catalog loaded"
        );
        if let Ok(mut v) = catalog.version.write() {
            *v = file.version;
        }
        Ok(catalog)
    }

    /// Merge a feed update. Returns the number of entries inserted or changed.
    pub fn apply_update(&self, models: Vec<ModelCandidate>) -> usize {
        let mut map = match self.models.write() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut changed = 0;

        for mut candidate in models {
            candidate.capabilities = candidate.capabilities.clamped();
            let id = (candidate.provider.clone(), candidate.model.clone());

            if let Some(existing) = map.get(&id) {
                if existing.deprecated && !candidate.deprecated {
                    warn!(
                        model = %candidate.id(),
                        "Ignoring attempt to re-activate a deprecated model"
                    );
                    candidate.deprecated = true;
                }
                if *existing == candidate {
                    continue;
                }
            }
            map.insert(id, candidate);
            changed += 1;
        }
        changed
    }

    pub fn version(&self) -> Option<String> {
        self.version.read().ok().and_then(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.models.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModelCatalog for InMemoryCatalog {
    fn list_active(&self) -> Vec<ModelCandidate> {
        self.models
            .read()
            .map(|m| m.values().filter(|c| !c.deprecated).cloned().collect())
            .unwrap_or_default()
    }

    fn get(&self, provider: &str, model: &str) -> Option<ModelCandidate> {
        self.models
            .read()
            .ok()?
            .get(&(provider.to_string(), model.to_string()))
            .cloned()
    }

    fn most_recently_active(&self) -> Option<ModelCandidate> {
        let map = self.models.read().ok()?;
        // BTreeMap iteration is ordered by id, so ties resolve to the last id.
        map.values().max_by(|a, b| a.last_seen.cmp(&b.last_seen)).cloned()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn candidate(
        provider: &str,
        model: &str,
        ratings: [f64; 5],
        price_per_1k: f64,
    ) -> ModelCandidate {
        ModelCandidate {
            provider: provider.into(),
            model: model.into(),
            capabilities: Capabilities {
                code_quality: ratings[0],
                speed: ratings[1],
                context_window: ratings[2],
                reasoning: ratings[3],
                detail_level: ratings[4],
            },
            pricing: Pricing {
                input_per_1k: price_per_1k,
                output_per_1k: price_per_1k,
            },
            deprecated: false,
            tags: vec![],
            last_seen: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    /// A small, realistic catalog shared by tests across the crate.
    pub(crate) fn sample_catalog() -> InMemoryCatalog {
        let mut legacy = candidate("openai", "gpt-3.5-turbo", [5.0, 9.0, 3.0, 4.0, 4.0], 0.001);
        legacy.deprecated = true;
        let mut sonnet = candidate("anthropic", "claude-sonnet", [9.0, 6.0, 8.0, 9.0, 8.0], 0.009);
        sonnet.tags = vec!["architecture".into(), "security".into()];
        InMemoryCatalog::new(vec![
            candidate("google", "gemini-flash-lite", [6.0, 10.0, 9.0, 5.0, 5.0], 0.0002),
            candidate("openai", "gpt-4o-mini", [7.0, 9.0, 6.0, 6.0, 6.0], 0.0004),
            sonnet,
            candidate("openai", "gpt-4o", [8.5, 7.0, 6.0, 8.0, 8.0], 0.00625),
            candidate("anthropic", "claude-opus", [10.0, 4.0, 8.0, 10.0, 10.0], 0.045),
            legacy,
        ])
    }

    #[test]
    fn test_list_active_excludes_deprecated() {
        let catalog = sample_catalog();
        let active = catalog.list_active();
        assert_eq!(active.len(), 5);
        assert!(active.iter().all(|c| !c.deprecated));
    }

    #[test]
    fn test_deprecation_is_monotonic() {
        let catalog = sample_catalog();
        let revived = candidate("openai", "gpt-3.5-turbo", [5.0, 9.0, 3.0, 4.0, 4.0], 0.001);
        catalog.apply_update(vec![revived]);
        let entry = catalog.get("openai", "gpt-3.5-turbo").unwrap();
        assert!(entry.deprecated, "Deprecated model must stay deprecated");
    }

    #[test]
    fn test_ratings_are_clamped() {
        let catalog =
            InMemoryCatalog::new(vec![candidate("x", "y", [14.0, -2.0, 5.0, 5.0, 5.0], 0.01)]);
        let c = catalog.get("x", "y").unwrap();
        assert_eq!(c.capabilities.code_quality, 10.0);
        assert_eq!(c.capabilities.speed, 0.0);
    }

    #[test]
    fn test_most_recently_active() {
        let mut old = candidate("a", "old", [5.0; 5], 0.01);
        old.deprecated = true;
        let mut newest = candidate("b", "newest", [5.0; 5], 0.01);
        newest.deprecated = true;
        newest.last_seen = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let catalog = InMemoryCatalog::new(vec![old, newest]);

        assert!(catalog.list_active().is_empty());
        assert_eq!(catalog.most_recently_active().unwrap().model, "newest");
    }

    #[test]
    fn test_shipped_catalog_parses() {
        let catalog =
            InMemoryCatalog::from_yaml_str(include_str!("../../config/catalog.yaml")).unwrap();
        assert_eq!(catalog.len(), 8);
        assert_eq!(catalog.list_active().len(), 7);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
version: "2026-10"
models:
  - provider: google
    model: gemini-pro
    capabilities: { code_quality: 9, speed: 6, context_window: 10, reasoning: 9, detail_level: 8 }
    pricing: { input_per_1k: 0.00125, output_per_1k: 0.01 }
    tags: [architecture]
"#;
        let catalog = InMemoryCatalog::from_yaml_str(yaml).unwrap();
        assert_eq!(catalog.version().as_deref(), Some("2026-10"));
        assert_eq!(catalog.list_active().len(), 1);
    }
}
