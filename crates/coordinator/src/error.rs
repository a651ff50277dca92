use std::fmt;

use shardgate_common::{BackendError, BackendErrorKind, BackendId};
use thiserror::Error;

use crate::transaction::TransactionState;

/// Every backend that failed during one fan-out, in fragment order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub failures: Vec<(BackendId, BackendError)>,
}

impl DispatchFailure {
    pub fn backends(&self) -> Vec<&BackendId> {
        self.failures.iter().map(|(backend, _)| backend).collect()
    }

    pub fn error_for(&self, backend: &str) -> Option<&BackendError> {
        self.failures
            .iter()
            .find(|(id, _)| id.as_str() == backend)
            .map(|(_, err)| err)
    }

    pub fn has_kind(&self, kind: BackendErrorKind) -> bool {
        self.failures.iter().any(|(_, err)| err.kind() == kind)
    }
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} backend(s) failed", self.failures.len())?;
        for (i, (backend, err)) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {}", sep, backend, err)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Failed to load configuration")]
    Config(#[from] config::ConfigError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No live backends available")]
    NoLiveBackends,

    #[error("Dispatch failed, {0}")]
    Dispatch(DispatchFailure),

    /// Some participants committed before another failed. The committed ones
    /// stay committed; the logical transaction is no longer atomic and needs
    /// manual remediation.
    ///
    /// Every participant lands in exactly one of `committed`, `rolled_back`
    /// or `rollback_failed`; `failed` names the participant whose commit was
    /// refused.
    #[error(
        "Partial commit: committed {committed:?}, failed {failed:?}, rolled back {rolled_back:?}, rollback failed {rollback_failed:?}"
    )]
    PartialCommitFailure {
        committed: Vec<BackendId>,
        failed: Vec<(BackendId, BackendError)>,
        rolled_back: Vec<BackendId>,
        /// Uncommitted participants whose rollback also failed; they may
        /// still hold an open backend transaction.
        rollback_failed: Vec<(BackendId, BackendError)>,
    },

    /// The first participant refused to commit; nothing was committed.
    #[error(
        "Commit aborted by {failed:?}, rolled back {rolled_back:?}, rollback failed {rollback_failed:?}"
    )]
    CommitAborted {
        failed: (BackendId, BackendError),
        rolled_back: Vec<BackendId>,
        rollback_failed: Vec<(BackendId, BackendError)>,
    },

    /// A statement or begin failed and the abort that followed could not roll
    /// back every participant.
    #[error("{cause}; rollback failed on {rollback_failed:?}")]
    AbortIncomplete {
        cause: Box<CoordinatorError>,
        rollback_failed: Vec<(BackendId, BackendError)>,
    },

    #[error("Rollback failed on {0:?}")]
    Rollback(Vec<(BackendId, BackendError)>),

    #[error("Schema mismatch between {expected} and {found}: {detail}")]
    SchemaMismatch {
        expected: BackendId,
        found: BackendId,
        detail: String,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request timed out")]
    TimedOut,

    #[error("Cannot {operation} a transaction in state {state}")]
    InvalidState {
        operation: &'static str,
        state: TransactionState,
    },
}

impl CoordinatorError {
    /// Attaches rollback failures from an abort to the error that caused it.
    pub(crate) fn with_rollback_failures(
        self,
        rollback_failed: Vec<(BackendId, BackendError)>,
    ) -> Self {
        if rollback_failed.is_empty() {
            return self;
        }
        CoordinatorError::AbortIncomplete {
            cause: Box::new(self),
            rollback_failed,
        }
    }

    /// Only a partial commit leaves backends in a state that retrying cannot fix.
    pub fn requires_operator_attention(&self) -> bool {
        matches!(self, CoordinatorError::PartialCommitFailure { .. })
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
