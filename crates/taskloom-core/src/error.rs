use thiserror::Error;

/// Result alias used across all Taskloom crates.
pub type TaskloomResult<T> = Result<T, TaskloomError>;

/// Error taxonomy for the orchestration engine.
///
/// Transient provider conditions (`Provider`, `RateLimited`, `Timeout`) are
/// candidates for retry with backoff. Quality failures are *not* errors —
/// they travel as [`crate::types::WorkerStatus`] values. Everything else is
/// fatal for the unit of work that raised it.
#[derive(Error, Debug)]
pub enum TaskloomError {
    /// The LLM provider or job queue rejected or dropped a request.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The provider asked us to slow down. The hint, when present, is the
    /// delay in milliseconds the provider suggested.
    #[error("Rate limited by provider")]
    RateLimited {
        /// Provider-supplied retry-after hint in milliseconds.
        retry_after_ms: Option<u64>,
    },

    /// An awaited job did not settle within its deadline.
    #[error("Timed out after {0}s waiting for job")]
    Timeout(u64),

    /// The quality gate itself malfunctioned (not a failed verdict).
    #[error("Quality gate error: {0}")]
    Quality(String),

    /// Snapshot persistence or retrieval failed.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Pipeline-level failure (leader run, plan parsing, integration).
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A retryable operation exhausted its retry budget.
    #[error("Max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        /// Total attempts made, including the first.
        attempts: u32,
        /// Display form of the final error.
        last_error: String,
    },

    /// JSON encode/decode failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
