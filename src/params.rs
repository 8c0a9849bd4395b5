//! Parameter normalizer: raw request context to canonical parameters.
//!
//! The seven categorical fields are the sole identity of a cache entry.
//! Feature flags are inferred from those fields only, so two requests with
//! the same key always carry the same flags.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::NormalizerConfig;
use crate::error::{MatrixError, Result};

/// Separator between the seven fields of a [`ConfigKey`].
pub const KEY_SEPARATOR: char = '|';

// ── Enums ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speed {
    Fast,
    Medium,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoSize {
    Small,
    Medium,
    Large,
    Enterprise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostSensitivity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityRequirement {
    Basic,
    Good,
    Excellent,
    Perfect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    PrReview,
    Architecture,
    Security,
    Performance,
    Documentation,
}

/// Canonical token plus accepted aliases for each enum.
trait Canonical: Sized + Copy + 'static {
    const FIELD: &'static str;
    const VARIANTS: &'static [(Self, &'static str, &'static [&'static str])];

    fn as_str(self) -> &'static str
    where
        Self: PartialEq,
    {
        Self::VARIANTS
            .iter()
            .find(|(v, _, _)| *v == self)
            .map(|(_, name, _)| *name)
            .unwrap_or("unknown")
    }

    fn parse(raw: &str) -> Result<Self> {
        let token = canonical_token(raw);
        if token.is_empty() {
            return Err(MatrixError::invalid(Self::FIELD, "must not be empty"));
        }
        Self::VARIANTS
            .iter()
            .find(|(_, name, aliases)| *name == token || aliases.contains(&token.as_str()))
            .map(|(v, _, _)| *v)
            .ok_or_else(|| MatrixError::invalid(Self::FIELD, format!("unknown value '{}'", raw.trim())))
    }
}

impl Canonical for Speed {
    const FIELD: &'static str = "speed";
    const VARIANTS: &'static [(Self, &'static str, &'static [&'static str])] = &[
        (Speed::Fast, "fast", &["quick"]),
        (Speed::Medium, "medium", &["normal", "balanced"]),
        (Speed::Slow, "slow", &["thorough"]),
    ];
}

impl Canonical for Complexity {
    const FIELD: &'static str = "complexity";
    const VARIANTS: &'static [(Self, &'static str, &'static [&'static str])] = &[
        (Complexity::Simple, "simple", &["low"]),
        (Complexity::Moderate, "moderate", &["medium"]),
        (Complexity::Complex, "complex", &["high"]),
    ];
}

impl Canonical for RepoSize {
    const FIELD: &'static str = "repo_size";
    const VARIANTS: &'static [(Self, &'static str, &'static [&'static str])] = &[
        (RepoSize::Small, "small", &[]),
        (RepoSize::Medium, "medium", &[]),
        (RepoSize::Large, "large", &[]),
        (RepoSize::Enterprise, "enterprise", &["huge"]),
    ];
}

impl Canonical for CostSensitivity {
    const FIELD: &'static str = "cost_sensitivity";
    const VARIANTS: &'static [(Self, &'static str, &'static [&'static str])] = &[
        (CostSensitivity::Low, "low", &[]),
        (CostSensitivity::Medium, "medium", &[]),
        (CostSensitivity::High, "high", &[]),
    ];
}

impl Canonical for QualityRequirement {
    const FIELD: &'static str = "quality_requirement";
    const VARIANTS: &'static [(Self, &'static str, &'static [&'static str])] = &[
        (QualityRequirement::Basic, "basic", &[]),
        (QualityRequirement::Good, "good", &[]),
        (QualityRequirement::Excellent, "excellent", &["high_quality"]),
        (QualityRequirement::Perfect, "perfect", &[]),
    ];
}

impl Canonical for AnalysisType {
    const FIELD: &'static str = "analysis_type";
    const VARIANTS: &'static [(Self, &'static str, &'static [&'static str])] = &[
        (AnalysisType::PrReview, "pr_review", &["pr", "review", "pull_request"]),
        (AnalysisType::Architecture, "architecture", &["arch"]),
        (AnalysisType::Security, "security", &["sec"]),
        (AnalysisType::Performance, "performance", &["perf"]),
        (AnalysisType::Documentation, "documentation", &["docs"]),
    ];
}

macro_rules! display_canonical {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(Canonical::as_str(*self))
                }
            }

            impl std::str::FromStr for $ty {
                type Err = MatrixError;

                fn from_str(s: &str) -> Result<Self> {
                    <$ty as Canonical>::parse(s)
                }
            }
        )*
    };
}

display_canonical!(Speed, Complexity, RepoSize, CostSensitivity, QualityRequirement, AnalysisType);

/// Lower-case, trim, and fold `-` and spaces into `_`.
fn canonical_token(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
        .collect()
}

// ── Parameters & Key ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub needs_reasoning: bool,
    pub needs_code_execution: bool,
    pub needs_web_search: bool,
    pub needs_multi_file: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnalysisParameters {
    pub speed: Speed,
    pub complexity: Complexity,
    pub language: String,
    pub repo_size: RepoSize,
    pub cost_sensitivity: CostSensitivity,
    pub quality_requirement: QualityRequirement,
    pub analysis_type: AnalysisType,
    pub features: FeatureFlags,
}

impl AnalysisParameters {
    /// Build parameters from already-canonical fields, inferring flags.
    pub fn new(
        speed: Speed,
        complexity: Complexity,
        language: &str,
        repo_size: RepoSize,
        cost_sensitivity: CostSensitivity,
        quality_requirement: QualityRequirement,
        analysis_type: AnalysisType,
    ) -> Self {
        let mut params = Self {
            speed,
            complexity,
            language: canonical_language(language),
            repo_size,
            cost_sensitivity,
            quality_requirement,
            analysis_type,
            features: FeatureFlags::default(),
        };
        params.features = infer_features(&params);
        params
    }

    pub fn key(&self) -> ConfigKey {
        ConfigKey::from_parameters(self)
    }
}

/// Deterministic cache identity: the seven fields joined in fixed order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigKey(String);

impl ConfigKey {
    fn from_parameters(p: &AnalysisParameters) -> Self {
        let fields = [
            p.speed.to_string(),
            p.complexity.to_string(),
            p.language.clone(),
            p.repo_size.to_string(),
            p.cost_sensitivity.to_string(),
            p.quality_requirement.to_string(),
            p.analysis_type.to_string(),
        ];
        Self(fields.join(&KEY_SEPARATOR.to_string()))
    }

    /// Wrap a key read back from storage.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Raw Context ─────────────────────────────────────────────────────

/// Loosely typed request context as it arrives from a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawContext {
    pub speed: Option<String>,
    pub complexity: Option<String>,
    pub language: Option<String>,
    pub repo_size: Option<String>,
    pub file_count: Option<u64>,
    pub line_count: Option<u64>,
    pub cost_sensitivity: Option<String>,
    pub quality_requirement: Option<String>,
    pub analysis_type: Option<String>,
}

/// Canonicalize a raw context into parameters and their key.
pub fn normalize(raw: &RawContext, config: &NormalizerConfig) -> Result<(AnalysisParameters, ConfigKey)> {
    let language = raw.language.as_deref().map(canonical_language).unwrap_or_default();
    if language.is_empty() {
        return Err(MatrixError::invalid("language", "must not be empty"));
    }

    let analysis_type = match raw.analysis_type.as_deref() {
        Some(s) => AnalysisType::parse(s)?,
        None => return Err(MatrixError::invalid("analysis_type", "must not be empty")),
    };

    let speed = parse_or(raw.speed.as_deref(), Speed::Medium)?;
    let complexity = parse_or(raw.complexity.as_deref(), Complexity::Moderate)?;
    let cost_sensitivity = parse_or(raw.cost_sensitivity.as_deref(), CostSensitivity::Medium)?;
    let quality_requirement = parse_or(raw.quality_requirement.as_deref(), QualityRequirement::Good)?;

    let repo_size = match raw.repo_size.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(s) => RepoSize::parse(s)?,
        None => bucket_repo_size(raw.file_count, raw.line_count, config),
    };

    let params = AnalysisParameters::new(
        speed,
        complexity,
        &language,
        repo_size,
        cost_sensitivity,
        quality_requirement,
        analysis_type,
    );
    let key = params.key();
    Ok((params, key))
}

fn parse_or<T: Canonical>(raw: Option<&str>, default: T) -> Result<T> {
    match raw {
        Some(s) if !s.trim().is_empty() => T::parse(s),
        _ => Ok(default),
    }
}

/// Lower-case and strip anything that could collide with the key separator.
fn canonical_language(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == KEY_SEPARATOR || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Bucket file/line counts into a repository size. With only one count the
/// other dimension is treated as unconstrained.
pub fn bucket_repo_size(files: Option<u64>, lines: Option<u64>, config: &NormalizerConfig) -> RepoSize {
    if files.is_none() && lines.is_none() {
        return RepoSize::Medium;
    }
    let under = |max_files: u64, max_lines: u64| {
        files.map_or(true, |f| f < max_files) && lines.map_or(true, |l| l < max_lines)
    };

    if under(config.small_max_files, config.small_max_lines) {
        RepoSize::Small
    } else if under(config.medium_max_files, config.medium_max_lines) {
        RepoSize::Medium
    } else if under(config.large_max_files, config.large_max_lines) {
        RepoSize::Large
    } else {
        RepoSize::Enterprise
    }
}

fn infer_features(p: &AnalysisParameters) -> FeatureFlags {
    FeatureFlags {
        needs_reasoning: matches!(p.analysis_type, AnalysisType::Architecture | AnalysisType::Security)
            || p.complexity == Complexity::Complex
            || p.quality_requirement == QualityRequirement::Perfect,
        needs_code_execution: p.analysis_type == AnalysisType::Performance,
        needs_web_search: p.analysis_type == AnalysisType::Security,
        needs_multi_file: p.analysis_type == AnalysisType::Architecture
            || matches!(p.repo_size, RepoSize::Large | RepoSize::Enterprise),
    }
}
