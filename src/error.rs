//! Error taxonomy for the matrix.
//!
//! Only `InvalidParameters` ever reaches a caller of the resolver. Every
//! other variant is recovered locally into a degraded configuration on the
//! request path, or recorded per key on the maintenance path.

use std::time::Duration;

use crate::recommender::RecommenderError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    #[error("invalid parameters: {field}: {reason}")]
    InvalidParameters { field: &'static str, reason: String },

    #[error("recommender timed out after {0:?}")]
    RecommenderTimeout(Duration),

    #[error("recommender error: {0}")]
    Recommender(#[from] RecommenderError),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("no active catalog model matches the request")]
    AllCandidatesDeprecated,

    #[error("configuration error: {0}")]
    Config(String),
}

impl MatrixError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            field,
            reason: reason.into(),
        }
    }

    /// Transient causes are retried on the next pass or replaced by a
    /// heuristic; they are never surfaced to a resolver caller.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidParameters { .. } | Self::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, MatrixError>;
