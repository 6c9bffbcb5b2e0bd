//! The error taxonomy shared by the forge client, orchestrator, and
//! scheduler.
//!
//! Retry decisions live in the scheduler and are driven entirely by the
//! error *kind*, so every component that talks to the outside world maps its
//! failures into this enum rather than letting provider-specific errors leak
//! across component boundaries.

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReviewError>;

#[derive(Error, Debug)]
pub enum ReviewError {
    /// Signature mismatch or an unusable signing key. Never retried.
    #[error("authentication failure: {0}")]
    Auth(String),

    /// The forge or model provider reported quota exhaustion.
    #[error("rate limited{}", reset_suffix(.reset_at))]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    /// Network timeout, connection reset, or 5xx-class response.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Installation, repository, or PR no longer exists. Terminal.
    #[error("not found: {0}")]
    NotFound(String),

    /// The forge rejected a specific item (bad position, malformed body).
    /// Per-item, never retried at task level.
    #[error("validation rejected: {0}")]
    Validation(String),

    /// The per-review budget is spent. Not an error condition: the pipeline
    /// truncates and proceeds to synthesis.
    #[error("cost ceiling reached")]
    CostCeiling,

    /// Cooperative cancellation. Partial results are committed.
    #[error("cancelled")]
    Cancelled,

    /// A bug: an internal invariant did not hold (e.g. a finding with a
    /// null position reached the poster). Dead-lettered with full context.
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

fn reset_suffix(reset_at: &Option<DateTime<Utc>>) -> String {
    match reset_at {
        Some(at) => format!(", resets at {}", at.to_rfc3339()),
        None => String::new(),
    }
}

impl ReviewError {
    /// Whether the scheduler should retry the task.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReviewError::RateLimited { .. } | ReviewError::Transient(_)
        )
    }

    /// Short machine-readable kind for logs and dead-letter rows.
    pub fn kind(&self) -> &'static str {
        match self {
            ReviewError::Auth(_) => "auth",
            ReviewError::RateLimited { .. } => "rate_limited",
            ReviewError::Transient(_) => "transient",
            ReviewError::NotFound(_) => "not_found",
            ReviewError::Validation(_) => "validation",
            ReviewError::CostCeiling => "cost_ceiling",
            ReviewError::Cancelled => "cancelled",
            ReviewError::Invariant(_) => "invariant",
        }
    }
}

impl From<reqwest::Error> for ReviewError {
    fn from(err: reqwest::Error) -> Self {
        // Anything that failed before a status code came back is transport
        // trouble and worth a retry.
        ReviewError::Transient(err.to_string())
    }
}
