//! # Error taxonomy
//!
//! One variant per category in the error taxonomy (spec.md §7). Adapter
//! crates (`coremachine-store`, `coremachine-bus`) define their own error
//! types and convert into `CoreError` via `#[from]` or explicit mapping.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Parameters rejected at submission time. No job record is created.
    #[error("validation error for job_type={job_type}: {reason}")]
    ValidationError { job_type: String, reason: String },

    /// Registry miss during job submission.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// Registry miss during task dispatch. The task is still recorded as
    /// FAILED with this as `error_kind`; this variant surfaces it to callers
    /// that need to react (e.g. logging) before that happens.
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    /// A task handler panicked/returned an `Err` instead of a tagged result.
    #[error("handler exception for task_type={task_type}: {detail}")]
    HandlerException { task_type: String, detail: String },

    /// A handler returned `success=false` with its own error kind/detail.
    #[error("handler reported failure: {kind}: {detail}")]
    HandlerReportedFailure { kind: String, detail: String },

    /// Bus send/receive failure, exhausted local retry.
    #[error("bus transient error: {0}")]
    BusTransient(String),

    /// State store connection/timeout failure, exhausted local retry.
    #[error("store transient error: {0}")]
    StoreTransient(String),

    /// Attempted to violate a monotonic invariant (I-J2, I-T1).
    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    /// Whether this error category is safe to retry locally without
    /// surfacing to handlers or submitters (spec.md §7 propagation policy).
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::BusTransient(_) | CoreError::StoreTransient(_))
    }
}
