use thiserror::Error;

/// Error reported by a single backend invocation.
///
/// Adapters map their transport and server errors onto these variants; the
/// coordinator attributes each one to the backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Connection or network failure reaching the backend.
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    /// The backend rejected the statement. The message is the backend's own.
    #[error("{0}")]
    Execution(String),
    #[error("invocation cancelled")]
    Cancelled,
    #[error("invocation timed out")]
    TimedOut,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Discriminant of [`BackendError`], for matching without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    Unreachable,
    Execution,
    Cancelled,
    TimedOut,
    Internal,
}

impl BackendError {
    pub fn kind(&self) -> BackendErrorKind {
        match self {
            BackendError::Unreachable(_) => BackendErrorKind::Unreachable,
            BackendError::Execution(_) => BackendErrorKind::Execution,
            BackendError::Cancelled => BackendErrorKind::Cancelled,
            BackendError::TimedOut => BackendErrorKind::TimedOut,
            BackendError::Internal(_) => BackendErrorKind::Internal,
        }
    }

    /// Whether the caller or driver layer may retry the invocation.
    ///
    /// The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unreachable(_) | BackendError::TimedOut)
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;
