//! Model configuration matrix.
//!
//! Resolves a code-analysis request, described by seven categorical
//! parameters, to a concrete model configuration. High-value combinations
//! are generated up front; the rest are generated on first request and
//! cached. Background maintenance keeps cached entries current as model
//! pricing and capability change.

pub mod catalog;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod matrix;
pub mod params;
pub mod recommender;
pub mod scoring;
pub mod store;
pub mod usage;

pub use catalog::{InMemoryCatalog, ModelCandidate, ModelCatalog};
pub use config::MatrixConfig;
pub use error::{MatrixError, Result};
pub use maintenance::{MaintenanceReport, MaintenanceScheduler, MaintenanceTask, TaskState};
pub use matrix::{
    FillSummary, GeneratedConfiguration, Generator, MatrixResolver, ModelSelection,
    PriorityFillPlanner, Resolution, ResolutionSource,
};
pub use params::{AnalysisParameters, ConfigKey, RawContext};
pub use recommender::{HeuristicRecommender, HttpRecommender, Recommender};
pub use scoring::SuitabilityScorer;
pub use store::{ConfigurationStore, SqliteConfigStore};
pub use usage::UsageTracker;
