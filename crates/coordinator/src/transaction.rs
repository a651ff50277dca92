//! Multi-backend transaction coordination.
//!
//! A logical transaction begins a backend-local transaction on each backend
//! the first time it is touched, and commits the participants one at a time
//! in backend order. This is weaker than two-phase commit: if a participant
//! fails after earlier ones committed, those stay committed and the failure
//! is reported as [`CoordinatorError::PartialCommitFailure`]. No compensation
//! is attempted.
//!
//! ```text
//! Idle -> Active(Read|Write) -> Committing -> Committed
//!         Active | Committing -> Aborting -> Aborted
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use shardgate_common::ordering::order_backends;
use shardgate_common::{
    AggregateResult, BackendError, BackendExecutor, BackendId, Request, TransactionMode,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatcher::{classify, guarded, ScatterDispatcher};
use crate::error::{CoordinatorError, Result};
use crate::merge::ResultMerger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Idle,
    Active(AccessMode),
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Idle => f.write_str("Idle"),
            TransactionState::Active(AccessMode::Read) => f.write_str("Active(Read)"),
            TransactionState::Active(AccessMode::Write) => f.write_str("Active(Write)"),
            TransactionState::Committing => f.write_str("Committing"),
            TransactionState::Committed => f.write_str("Committed"),
            TransactionState::Aborting => f.write_str("Aborting"),
            TransactionState::Aborted => f.write_str("Aborted"),
        }
    }
}

/// Entry point for statements, transactional or not.
pub struct TransactionCoordinator {
    dispatcher: Arc<ScatterDispatcher>,
}

impl TransactionCoordinator {
    pub fn new(dispatcher: Arc<ScatterDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<ScatterDispatcher> {
        &self.dispatcher
    }

    /// Creates a transaction in the `Idle` state.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.dispatcher.clone())
    }

    /// Creates a transaction that is already `Active`.
    pub fn begin(&self, mode: AccessMode) -> Transaction {
        let mut txn = self.transaction();
        txn.state = TransactionState::Active(mode);
        tracing::debug!(txn = %txn.id, ?mode, "transaction started");
        txn
    }

    /// Runs a statement outside any transaction.
    ///
    /// Requests tagged `Read` or `Write` must go through a [`Transaction`].
    pub async fn execute(&self, request: &Request) -> Result<AggregateResult> {
        match request.txn_mode() {
            TransactionMode::None => self.dispatcher.dispatch(request).await,
            TransactionMode::Read | TransactionMode::Write => Err(CoordinatorError::InvalidRequest(
                "transactional statement outside of an open transaction".to_string(),
            )),
        }
    }
}

/// One logical transaction spanning any number of backends.
pub struct Transaction {
    id: Uuid,
    state: TransactionState,
    /// Ordered by backend id, which fixes begin and commit order.
    participants: BTreeSet<BackendId>,
    dispatcher: Arc<ScatterDispatcher>,
}

impl Transaction {
    fn new(dispatcher: Arc<ScatterDispatcher>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: TransactionState::Idle,
            participants: BTreeSet::new(),
            dispatcher,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Participants in commit order.
    pub fn participants(&self) -> Vec<BackendId> {
        self.participants.iter().cloned().collect()
    }

    /// Moves an `Idle` transaction to `Active`.
    pub fn activate(&mut self, mode: AccessMode) -> Result<()> {
        if self.state != TransactionState::Idle {
            return Err(CoordinatorError::InvalidState {
                operation: "activate",
                state: self.state,
            });
        }
        self.state = TransactionState::Active(mode);
        tracing::debug!(txn = %self.id, ?mode, "transaction started");
        Ok(())
    }

    /// Starts a backend-local transaction on `backend` unless it already is a
    /// participant. A failure aborts the whole transaction.
    pub async fn begin_backend(&mut self, backend: BackendId) -> Result<()> {
        self.require_active("begin a backend in")?;
        let deadline = Instant::now() + self.dispatcher.settings().default_timeout;
        self.begin_participants(vec![backend], deadline, &CancellationToken::new())
            .await
    }

    pub async fn execute(&mut self, request: &Request) -> Result<AggregateResult> {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Runs `request` inside this transaction.
    ///
    /// New participants are begun one by one in backend order, then the
    /// statements fan out concurrently. Any backend failure rolls back every
    /// participant and leaves the transaction `Aborted`.
    pub async fn execute_with_cancel(
        &mut self,
        request: &Request,
        cancel: CancellationToken,
    ) -> Result<AggregateResult> {
        let access = self.require_active("execute in")?;
        match (access, request.txn_mode()) {
            (_, TransactionMode::None) => {
                return Err(CoordinatorError::InvalidRequest(
                    "statement without transaction context inside a transaction".to_string(),
                ))
            }
            (AccessMode::Read, TransactionMode::Write) => {
                return Err(CoordinatorError::InvalidRequest(
                    "write statement in a read-only transaction".to_string(),
                ))
            }
            (AccessMode::Read, TransactionMode::Read)
            | (AccessMode::Write, TransactionMode::Read)
            | (AccessMode::Write, TransactionMode::Write) => {}
        }

        let targets = self.dispatcher.route(request).await?;
        let deadline = self.dispatcher.deadline(request);
        self.begin_participants(
            targets.iter().map(|target| target.backend.clone()),
            deadline,
            &cancel,
        )
        .await?;

        match self
            .dispatcher
            .execute_targets(targets, deadline, &cancel)
            .await
        {
            // A merge error is not a backend failure; the transaction stays open.
            Ok(results) => ResultMerger::merge(request.mode(), results),
            Err(err) => {
                tracing::warn!(txn = %self.id, error = %err, "statement failed, aborting transaction");
                let rollback_failed = self.abort().await;
                Err(err.with_rollback_failures(rollback_failed))
            }
        }
    }

    /// Commits every participant sequentially in backend order.
    pub async fn commit(&mut self) -> Result<()> {
        self.require_active("commit")?;
        self.state = TransactionState::Committing;

        let order = self.participants();
        let executor = self.executor();
        tracing::info!(txn = %self.id, participants = order.len(), "committing");

        let mut committed = Vec::with_capacity(order.len());
        for (i, backend) in order.iter().enumerate() {
            match executor.commit(backend).await {
                Ok(()) => {
                    tracing::debug!(txn = %self.id, backend = %backend, "participant committed");
                    committed.push(backend.clone());
                }
                Err(err) => {
                    self.state = TransactionState::Aborting;
                    let uncommitted = &order[i..];
                    let rollback_failed = self.roll_back(uncommitted).await;
                    self.state = TransactionState::Aborted;

                    let rolled_back: Vec<BackendId> = uncommitted
                        .iter()
                        .filter(|b| !rollback_failed.iter().any(|(failed, _)| failed == *b))
                        .cloned()
                        .collect();

                    if committed.is_empty() {
                        tracing::warn!(txn = %self.id, backend = %backend, error = %err, "commit refused, nothing committed");
                        return Err(CoordinatorError::CommitAborted {
                            failed: (backend.clone(), err),
                            rolled_back,
                            rollback_failed,
                        });
                    }
                    tracing::error!(
                        txn = %self.id,
                        backend = %backend,
                        error = %err,
                        committed = ?committed,
                        "partial commit, manual remediation required"
                    );
                    return Err(CoordinatorError::PartialCommitFailure {
                        committed,
                        failed: vec![(backend.clone(), err)],
                        rolled_back,
                        rollback_failed,
                    });
                }
            }
        }

        self.state = TransactionState::Committed;
        tracing::info!(txn = %self.id, "committed");
        Ok(())
    }

    /// Rolls back every participant. A no-op on an `Aborted` transaction.
    ///
    /// On an `Idle` transaction no backend is contacted, but the transaction
    /// still ends `Aborted` and cannot be activated afterwards.
    pub async fn rollback(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Aborted => Ok(()),
            TransactionState::Idle => {
                self.state = TransactionState::Aborted;
                Ok(())
            }
            TransactionState::Committed => Err(CoordinatorError::InvalidState {
                operation: "roll back",
                state: self.state,
            }),
            TransactionState::Active(_)
            | TransactionState::Committing
            | TransactionState::Aborting => {
                let failures = self.abort().await;
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(CoordinatorError::Rollback(failures))
                }
            }
        }
    }

    fn executor(&self) -> Arc<dyn BackendExecutor> {
        self.dispatcher.executor().clone()
    }

    fn require_active(&self, operation: &'static str) -> Result<AccessMode> {
        match self.state {
            TransactionState::Active(mode) => Ok(mode),
            state => Err(CoordinatorError::InvalidState { operation, state }),
        }
    }

    async fn begin_participants<I>(
        &mut self,
        backends: I,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        I: IntoIterator<Item = BackendId>,
    {
        let fresh = order_backends(
            backends
                .into_iter()
                .filter(|backend| !self.participants.contains(backend)),
        );
        let executor = self.executor();
        for backend in fresh {
            match guarded(executor.begin(&backend), deadline, cancel).await {
                Ok(()) => {
                    tracing::debug!(txn = %self.id, backend = %backend, "participant begun");
                    self.participants.insert(backend);
                }
                Err(err) => {
                    tracing::warn!(txn = %self.id, backend = %backend, error = %err, "begin failed, aborting transaction");
                    // An interrupted begin may still have opened the backend transaction.
                    if matches!(err, BackendError::Cancelled | BackendError::TimedOut) {
                        self.participants.insert(backend.clone());
                    }
                    let rollback_failed = self.abort().await;
                    let cause = if cancel.is_cancelled() {
                        CoordinatorError::Cancelled
                    } else {
                        classify(vec![(backend, err)])
                    };
                    return Err(cause.with_rollback_failures(rollback_failed));
                }
            }
        }
        Ok(())
    }

    /// Rolls back `backends` concurrently, logging and returning each failure.
    async fn roll_back(&self, backends: &[BackendId]) -> Vec<(BackendId, BackendError)> {
        let failures = rollback_all(&self.executor(), backends).await;
        for (backend, err) in &failures {
            tracing::error!(txn = %self.id, backend = %backend, error = %err, "rollback failed");
        }
        failures
    }

    /// Rolls back all participants concurrently and ends in `Aborted`.
    async fn abort(&mut self) -> Vec<(BackendId, BackendError)> {
        self.state = TransactionState::Aborting;
        let participants = self.participants();
        let failures = self.roll_back(&participants).await;
        self.state = TransactionState::Aborted;
        tracing::info!(txn = %self.id, participants = participants.len(), "transaction aborted");
        failures
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.state.is_terminal() && !self.participants.is_empty() {
            tracing::warn!(
                txn = %self.id,
                state = %self.state,
                participants = ?self.participants,
                "transaction dropped without commit or rollback"
            );
        }
    }
}

async fn rollback_all(
    executor: &Arc<dyn BackendExecutor>,
    backends: &[BackendId],
) -> Vec<(BackendId, BackendError)> {
    join_all(backends.iter().map(|backend| async move {
        (backend.clone(), executor.rollback(backend).await)
    }))
    .await
    .into_iter()
    .filter_map(|(backend, outcome)| outcome.err().map(|err| (backend, err)))
    .collect()
}
