use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkErrorKind {
    /// The user work function returned an error or panicked
    User,
    /// Arguments or a produced value could not be encoded for transport
    Serialization,
    /// The submitted key is not present in the work registry
    UnknownCallable,
    /// The worker process died while holding the submission
    WorkerCrash,
}

impl WorkErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkErrorKind::User => "user-failure",
            WorkErrorKind::Serialization => "serialization",
            WorkErrorKind::UnknownCallable => "unknown-callable",
            WorkErrorKind::WorkerCrash => "worker-crash",
        }
    }
}

impl std::fmt::Display for WorkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure produced on behalf of a single submission.
///
/// `detail` carries the original error chain or panic payload as text,
/// captured at the failure site and transported verbatim.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("work failed ({kind}): {message}")]
pub struct WorkError {
    pub kind: WorkErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl WorkError {
    pub fn new(kind: WorkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(WorkErrorKind::User, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(WorkErrorKind::Serialization, message)
    }

    pub fn unknown_callable(key: &str) -> Self {
        Self::new(
            WorkErrorKind::UnknownCallable,
            format!("no work function registered under key '{}'", key),
        )
    }

    pub fn worker_crash(worker_id: usize) -> Self {
        Self::new(
            WorkErrorKind::WorkerCrash,
            format!("worker {} died while holding the submission", worker_id),
        )
    }
}

/// Errors surfaced to callers of the pool.
#[derive(Debug, Clone, Error)]
pub enum OffloadError {
    /// The work function failed (in a worker, or locally under fail-open).
    #[error(transparent)]
    Work(#[from] WorkError),

    /// The submission was cancelled before producing a result.
    #[error("submission cancelled")]
    Cancelled,

    /// Offload is disabled and fail-open execution is off.
    #[error("offload is disabled and fail-open execution is off")]
    OffloadDisabled,

    /// Operation not permitted in the pool's current lifecycle state.
    #[error("invalid pool state: {0}")]
    InvalidState(&'static str),

    /// Spawning a worker failed.
    #[error("worker spawn failed: {0}")]
    Spawn(String),
}

impl OffloadError {
    /// Whether this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OffloadError::Cancelled)
    }
}
