//! Error types for the pipeline resilience layer.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for pipeguard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pipeguard.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The rate limiter refused the request.
    #[error("admission rejected for client {client_id}, retry after {retry_after:?}")]
    AdmissionRejected {
        client_id: String,
        retry_after: Duration,
    },

    /// No healthy backend could serve the request.
    #[error("no backend available ({total} registered)")]
    BackendUnavailable { total: usize },

    /// Neither the primary nor any replica of a shard could serve the request.
    #[error("shard {shard_id} unavailable: {reason}")]
    ShardUnavailable { shard_id: String, reason: String },

    /// The breaker guarding a dependency is open.
    #[error("circuit open for {dependency} after {failures} consecutive failures")]
    CircuitOpen { dependency: String, failures: u32 },

    /// A task attempt exceeded its deadline.
    #[error("task {task_id} attempt {attempt} timed out after {elapsed:?}")]
    TaskTimeout {
        task_id: Uuid,
        attempt: u32,
        elapsed: Duration,
    },

    /// A task exhausted its attempts or hit a non-retryable error.
    #[error("task {task_id} failed after {attempts} attempt(s): {last_error}")]
    TaskFailedPermanently {
        task_id: Uuid,
        attempts: u32,
        last_error: Box<Error>,
    },

    /// The message queue is at capacity (backpressure).
    #[error("queue full: {pending} pending (capacity {capacity})")]
    QueueFull { capacity: usize, pending: usize },

    /// A pipeline stage reported a failure.
    #[error("stage error: {0}")]
    Stage(#[from] StageError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same work may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Stage(e) => e.is_retryable(),
            Error::BackendUnavailable { .. }
            | Error::ShardUnavailable { .. }
            | Error::CircuitOpen { .. }
            | Error::TaskTimeout { .. }
            | Error::QueueFull { .. }
            | Error::Internal(_) => true,
            Error::AdmissionRejected { .. }
            | Error::TaskFailedPermanently { .. }
            | Error::Config(_)
            | Error::NotFound(_)
            | Error::Cancelled => false,
        }
    }

    /// Short label used for error metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AdmissionRejected { .. } => "admission_rejected",
            Error::BackendUnavailable { .. } => "backend_unavailable",
            Error::ShardUnavailable { .. } => "shard_unavailable",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::TaskTimeout { .. } => "task_timeout",
            Error::TaskFailedPermanently { .. } => "task_failed",
            Error::QueueFull { .. } => "queue_full",
            Error::Stage(_) => "stage",
            Error::Config(_) => "config",
            Error::NotFound(_) => "not_found",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
        }
    }

    /// The innermost error, unwrapping permanent-failure wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::TaskFailedPermanently { last_error, .. } => last_error.root_cause(),
            other => other,
        }
    }
}

/// Errors reported by pipeline stage implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Transient failure; the work may be retried.
    #[error("{stage} failed: {message}")]
    Failed { stage: String, message: String },

    /// Permanent failure; retrying cannot help.
    #[error("{stage} failed fatally: {message}")]
    Fatal { stage: String, message: String },
}

impl StageError {
    pub fn failed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        StageError::Failed {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn fatal(stage: impl Into<String>, message: impl Into<String>) -> Self {
        StageError::Fatal {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Failed { .. })
    }

    /// Name of the stage that produced the error.
    pub fn stage(&self) -> &str {
        match self {
            StageError::Failed { stage, .. } | StageError::Fatal { stage, .. } => stage,
        }
    }
}
