//! Engine error taxonomy.
//!
//! Operations on the engine surface return [`EngineError`] so callers can
//! distinguish the cases that matter (absent object, partial delete, stale
//! query vector) from plumbing failures. Pipeline-internal failures carry an
//! [`AnalysisFailure`] classification that decides whether a task is retried.

use thiserror::Error;

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The fingerprint is not present on the requested endpoint(s).
    #[error("object {fingerprint} not found")]
    NotFound { fingerprint: String },

    /// A delete removed the object from some endpoints but not all.
    /// Copies on the listed endpoints are still intact; retrying the
    /// delete converges.
    #[error("delete of {fingerprint} failed on endpoints: {}", failed.join(", "))]
    PartialDelete {
        fingerprint: String,
        failed: Vec<String>,
    },

    /// The query vector's dimensionality differs from the index.
    #[error("query vector has {got} dims, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    /// A storage endpoint could not be reached.
    #[error("endpoint '{endpoint}' unavailable: {reason}")]
    EndpointUnavailable { endpoint: String, reason: String },

    /// No task with the given id exists.
    #[error("unknown task {0}")]
    UnknownTask(String),

    /// The payload is not a supported image format.
    #[error("unsupported payload: {0}")]
    UnsupportedFormat(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Classification of an analysis failure.
///
/// Retryable failures are requeued with backoff until the attempt budget is
/// spent; permanent failures end the task immediately.
#[derive(Debug, Error)]
pub enum AnalysisFailure {
    /// Transient: network error, timeout, rate limit, server error.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Terminal: unparseable model output, auth rejection, unsupported input.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl AnalysisFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalysisFailure::Retryable(_))
    }

    /// Classify an HTTP status the way the retry loop does: 429 and 5xx are
    /// transient, any other 4xx is not.
    pub fn from_status(status: u16, body: &str) -> Self {
        if status == 429 || status >= 500 {
            AnalysisFailure::Retryable(format!("HTTP {}: {}", status, truncate(body, 200)))
        } else {
            AnalysisFailure::Permanent(format!("HTTP {}: {}", status, truncate(body, 200)))
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
