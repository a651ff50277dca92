//! Scatter dispatcher: routes a request to its backends, fans the work out
//! concurrently and joins every invocation before merging.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use shardgate_common::ordering::{first_backend, order_backends, order_fragments};
use shardgate_common::{
    AggregateResult, BackendError, BackendExecutor, BackendId, BackendRegistry, BackendResult,
    DispatchMode, Fragment, QueryResult, Request,
};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::DispatchSettings;
use crate::error::{CoordinatorError, DispatchFailure, Result};
use crate::merge::ResultMerger;

/// One statement bound to the backend that runs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub backend: BackendId,
    pub statement: String,
}

/// Dispatches requests to backends. Holds no state between calls.
pub struct ScatterDispatcher {
    executor: Arc<dyn BackendExecutor>,
    registry: Arc<dyn BackendRegistry>,
    settings: DispatchSettings,
}

impl ScatterDispatcher {
    pub fn new(
        executor: Arc<dyn BackendExecutor>,
        registry: Arc<dyn BackendRegistry>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            executor,
            registry,
            settings,
        }
    }

    pub fn executor(&self) -> &Arc<dyn BackendExecutor> {
        &self.executor
    }

    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    pub async fn dispatch(&self, request: &Request) -> Result<AggregateResult> {
        self.dispatch_with_cancel(request, CancellationToken::new()).await
    }

    /// Dispatches `request`, stopping every in-flight invocation when `cancel`
    /// fires or the request deadline passes.
    pub async fn dispatch_with_cancel(
        &self,
        request: &Request,
        cancel: CancellationToken,
    ) -> Result<AggregateResult> {
        let targets = self.route(request).await?;
        let deadline = self.deadline(request);
        let results = self.execute_targets(targets, deadline, &cancel).await?;
        ResultMerger::merge(request.mode(), results)
    }

    /// Deadline for `request`: its own timeout, else the configured default.
    pub fn deadline(&self, request: &Request) -> Instant {
        Instant::now() + request.timeout().unwrap_or(self.settings.default_timeout)
    }

    /// Computes the targets of `request` in fragment order.
    pub async fn route(&self, request: &Request) -> Result<Vec<Target>> {
        match request.mode() {
            DispatchMode::Normal => {
                validate_fragments(request.fragments())?;
                Ok(order_fragments(request.fragments())
                    .into_iter()
                    .map(|fragment| {
                        tracing::debug!(
                            backend = %fragment.backend,
                            range = %fragment.range_hint,
                            "routing fragment"
                        );
                        Target {
                            backend: fragment.backend.clone(),
                            statement: fragment.statement.clone(),
                        }
                    })
                    .collect())
            }
            DispatchMode::ScatterAll => {
                let live = order_backends(self.registry.live_backends().await);
                if live.is_empty() {
                    return Err(CoordinatorError::NoLiveBackends);
                }
                Ok(live
                    .into_iter()
                    .map(|backend| Target {
                        backend,
                        statement: request.raw_statement().to_string(),
                    })
                    .collect())
            }
            DispatchMode::SingleFirst => {
                let first = if request.fragments().is_empty() {
                    first_backend(self.registry.live_backends().await)
                } else {
                    first_backend(request.fragments().iter().map(|f| f.backend.clone()))
                };
                let backend = first.ok_or(CoordinatorError::NoLiveBackends)?;
                Ok(vec![Target {
                    backend,
                    statement: request.raw_statement().to_string(),
                }])
            }
        }
    }

    /// Runs every target concurrently, one task per backend, and waits for all
    /// of them. Results come back in target order.
    ///
    /// Any failure fails the call, but only after every task has finished or
    /// been cancelled. If this future is dropped early, the tasks are aborted
    /// with their `JoinSet`.
    pub async fn execute_targets(
        &self,
        targets: Vec<Target>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Vec<(BackendId, QueryResult)>> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        tracing::debug!(targets = targets.len(), "fanning out");
        let mut pending: Vec<Option<BackendId>> = Vec::with_capacity(targets.len());
        let mut tasks = JoinSet::new();
        for (index, target) in targets.into_iter().enumerate() {
            pending.push(Some(target.backend.clone()));
            let executor = self.executor.clone();
            let token = cancel.clone();
            tasks.spawn(async move {
                let Target { backend, statement } = target;
                let invocation = guarded(executor.execute(&backend, &statement), deadline, &token);
                let outcome = AssertUnwindSafe(invocation)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(BackendError::Internal(format!(
                            "backend task panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    });
                (index, backend, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, backend, outcome)) => {
                    pending[index] = None;
                    outcomes.push((index, backend, outcome));
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "backend task aborted");
                }
            }
        }
        // Tasks that never reported back were aborted by the runtime.
        for (index, backend) in pending.into_iter().enumerate() {
            if let Some(backend) = backend {
                outcomes.push((
                    index,
                    backend,
                    Err(BackendError::Internal("backend task aborted".to_string())),
                ));
            }
        }
        outcomes.sort_by_key(|(index, _, _)| *index);

        let mut results = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (_, backend, outcome) in outcomes {
            match outcome {
                Ok(result) => results.push((backend, result)),
                Err(err) => {
                    tracing::warn!(backend = %backend, error = %err, "backend invocation failed");
                    failures.push((backend, err));
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(CoordinatorError::Cancelled);
        }
        if failures.is_empty() {
            return Ok(results);
        }
        Err(classify(failures))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Races `invocation` against cancellation and the deadline. The losing
/// invocation future is dropped, which unwinds it.
pub(crate) async fn guarded<T, F>(
    invocation: F,
    deadline: Instant,
    cancel: &CancellationToken,
) -> BackendResult<T>
where
    F: Future<Output = BackendResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackendError::Cancelled),
        _ = sleep_until(deadline) => Err(BackendError::TimedOut),
        result = invocation => result,
    }
}

/// Collapses a failure list that only holds deadline expiries into `TimedOut`;
/// anything else is reported backend by backend.
pub(crate) fn classify(failures: Vec<(BackendId, BackendError)>) -> CoordinatorError {
    if failures
        .iter()
        .all(|(_, err)| matches!(err, BackendError::TimedOut))
    {
        return CoordinatorError::TimedOut;
    }
    CoordinatorError::Dispatch(DispatchFailure { failures })
}

fn validate_fragments(fragments: &[Fragment]) -> Result<()> {
    let mut seen = HashSet::with_capacity(fragments.len());
    for fragment in fragments {
        if fragment.backend.as_str().is_empty() {
            return Err(CoordinatorError::InvalidRequest(
                "fragment has an empty backend id".to_string(),
            ));
        }
        if !seen.insert(&fragment.backend) {
            return Err(CoordinatorError::InvalidRequest(format!(
                "backend {} is targeted by more than one fragment",
                fragment.backend
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardgate_common::StaticRegistry;
    use shardgate_worker::MemoryBackend;

    fn dispatcher(live: &[&str]) -> ScatterDispatcher {
        ScatterDispatcher::new(
            Arc::new(MemoryBackend::new(live.iter().copied())),
            Arc::new(StaticRegistry::new(live.iter().copied())),
            DispatchSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_route_normal_in_backend_order() {
        let request = Request::normal(
            "SELECT * FROM t",
            vec![
                Fragment::new("SELECT * FROM t_2", "b2", "[200, 300)"),
                Fragment::new("SELECT * FROM t_1", "b1", "[100, 200)"),
            ],
        );
        let targets = dispatcher(&["b1", "b2"]).route(&request).await.unwrap();
        assert_eq!(
            targets,
            vec![
                Target {
                    backend: BackendId::from("b1"),
                    statement: "SELECT * FROM t_1".into()
                },
                Target {
                    backend: BackendId::from("b2"),
                    statement: "SELECT * FROM t_2".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_route_rejects_duplicate_backends() {
        let request = Request::normal(
            "UPDATE t SET x = 1",
            vec![
                Fragment::new("UPDATE t_0 SET x = 1", "b1", ""),
                Fragment::new("UPDATE t_1 SET x = 1", "b1", ""),
            ],
        );
        let err = dispatcher(&["b1"]).route(&request).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_route_single_first_prefers_fragment_backends() {
        let request = Request::new(
            "SELECT 1",
            DispatchMode::SingleFirst,
            shardgate_common::TransactionMode::None,
            vec![Fragment::new("", "m", ""), Fragment::new("", "k", "")],
        );
        let targets = dispatcher(&["a", "k", "m"]).route(&request).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].backend, BackendId::from("k"));
        assert_eq!(targets[0].statement, "SELECT 1");
    }

    #[tokio::test]
    async fn test_route_without_live_backends() {
        let d = dispatcher(&[]);
        assert!(matches!(
            d.route(&Request::scatter_all("SELECT 1")).await,
            Err(CoordinatorError::NoLiveBackends)
        ));
        assert!(matches!(
            d.route(&Request::single_first("SELECT 1")).await,
            Err(CoordinatorError::NoLiveBackends)
        ));
    }

    /// Delegates to a `MemoryBackend` but panics when executing on `b2`.
    struct PanicsOnB2(MemoryBackend);

    #[async_trait::async_trait]
    impl BackendExecutor for PanicsOnB2 {
        async fn execute(&self, backend: &BackendId, statement: &str) -> BackendResult<QueryResult> {
            if backend.as_str() == "b2" {
                panic!("driver crashed");
            }
            self.0.execute(backend, statement).await
        }

        async fn begin(&self, backend: &BackendId) -> BackendResult<()> {
            self.0.begin(backend).await
        }

        async fn commit(&self, backend: &BackendId) -> BackendResult<()> {
            self.0.commit(backend).await
        }

        async fn rollback(&self, backend: &BackendId) -> BackendResult<()> {
            self.0.rollback(backend).await
        }
    }

    #[tokio::test]
    async fn test_panicking_task_is_attributed_to_its_backend() {
        let d = ScatterDispatcher::new(
            Arc::new(PanicsOnB2(MemoryBackend::new(["b1", "b2", "b3"]))),
            Arc::new(StaticRegistry::new(["b1", "b2", "b3"])),
            DispatchSettings::default(),
        );
        let targets = d.route(&Request::scatter_all("SELECT 1")).await.unwrap();
        let deadline = d.deadline(&Request::scatter_all("SELECT 1"));

        let err = d
            .execute_targets(targets, deadline, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            CoordinatorError::Dispatch(failure) => {
                assert_eq!(failure.backends(), vec![&BackendId::from("b2")]);
                match failure.error_for("b2") {
                    Some(BackendError::Internal(message)) => {
                        assert!(message.contains("driver crashed"), "{}", message)
                    }
                    other => panic!("expected Internal, got {:?}", other),
                }
            }
            other => panic!("expected Dispatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_targets_keeps_target_order() {
        let memory = MemoryBackend::new(["b1", "b2", "b3"]);
        memory.delay("b1", shardgate_worker::Operation::Execute, std::time::Duration::from_millis(30)).await;
        memory.set_default_result("b1", QueryResult::affected(1)).await;
        memory.set_default_result("b3", QueryResult::affected(3)).await;
        let d = ScatterDispatcher::new(
            Arc::new(memory),
            Arc::new(StaticRegistry::new(["b1", "b2", "b3"])),
            DispatchSettings::default(),
        );
        let request = Request::scatter_all("DELETE FROM t");
        let targets = d.route(&request).await.unwrap();

        let results = d
            .execute_targets(targets, d.deadline(&request), &CancellationToken::new())
            .await
            .unwrap();
        let order: Vec<_> = results.iter().map(|(b, r)| (b.as_str(), r.rows_affected)).collect();
        assert_eq!(order, vec![("b1", 1), ("b2", 0), ("b3", 3)]);
    }

    #[test]
    fn test_classify_timeouts() {
        let only_timeouts = vec![
            (BackendId::from("a"), BackendError::TimedOut),
            (BackendId::from("b"), BackendError::TimedOut),
        ];
        assert!(matches!(classify(only_timeouts), CoordinatorError::TimedOut));

        let mixed = vec![
            (BackendId::from("a"), BackendError::TimedOut),
            (BackendId::from("b"), BackendError::Execution("bad".into())),
        ];
        match classify(mixed) {
            CoordinatorError::Dispatch(failure) => assert_eq!(failure.failures.len(), 2),
            other => panic!("expected Dispatch, got {:?}", other),
        }
    }
}
