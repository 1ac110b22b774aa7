//! Error types for the pairs engine

use thiserror::Error;

/// Failures surfaced by the engine.
///
/// Insufficient history is never an error: metrics that cannot be computed are
/// reported as `None`. Cancellation is a job outcome, not an error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Malformed request: inverted range, unknown timeframe, empty basket, bad pair key
    #[error("Invalid request: {0}")]
    InvalidRange(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The store handed back bars that violate ordering or positivity
    #[error("Invalid series: {0}")]
    InvalidSeries(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A background task panicked or was aborted
    #[error("Worker failure: {0}")]
    Worker(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<persistence::DbError> for EngineError {
    fn from(e: persistence::DbError) -> Self {
        EngineError::UpstreamUnavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::Worker(e.to_string())
    }
}
