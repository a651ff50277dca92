use std::sync::Arc;
use std::time::Duration;

use shardgate_common::{
    BackendError, BackendErrorKind, BackendId, DataType, Field, Fragment, QueryResult, Request,
    Schema, StaticRegistry, Value,
};
use shardgate_coordinator::{
    ClusterRegistry, CoordinatorError, DispatchSettings, ScatterDispatcher,
};
use shardgate_worker::{MemoryBackend, Operation};
use tokio_util::sync::CancellationToken;

fn setup(backends: &[&str]) -> (Arc<MemoryBackend>, ScatterDispatcher) {
    let memory = Arc::new(MemoryBackend::new(backends.iter().copied()));
    let dispatcher = ScatterDispatcher::new(
        memory.clone(),
        Arc::new(StaticRegistry::new(backends.iter().copied())),
        DispatchSettings::default(),
    );
    (memory, dispatcher)
}

fn ids(names: &[&str]) -> Vec<BackendId> {
    names.iter().map(|n| BackendId::from(*n)).collect()
}

fn named_rows(name: &str) -> QueryResult {
    QueryResult::new(
        Schema::new(vec![Field::new("origin", DataType::Text, false)]),
        vec![vec![Value::Text(name.to_string())]],
    )
}

#[tokio::test(start_paused = true)]
async fn test_normal_rows_follow_backend_order_not_completion_order() {
    let (memory, dispatcher) = setup(&["b1", "b2", "b3"]);
    for (backend, delay_ms) in [("b1", 300), ("b2", 200), ("b3", 100)] {
        memory
            .set_result(backend, &format!("SELECT origin FROM t_{}", backend), named_rows(backend))
            .await;
        memory
            .delay(backend, Operation::Execute, Duration::from_millis(delay_ms))
            .await;
    }

    let request = Request::normal(
        "SELECT origin FROM t",
        vec![
            Fragment::new("SELECT origin FROM t_b3", "b3", "[200, 300)"),
            Fragment::new("SELECT origin FROM t_b1", "b1", "[0, 100)"),
            Fragment::new("SELECT origin FROM t_b2", "b2", "[100, 200)"),
        ],
    );
    let result = dispatcher.dispatch(&request).await.unwrap();

    assert_eq!(
        result.rows,
        vec![
            vec![Value::Text("b1".into())],
            vec![Value::Text("b2".into())],
            vec![Value::Text("b3".into())],
        ]
    );
    assert_eq!(result.sources, ids(&["b1", "b2", "b3"]));

    let mut executed = memory.backends_for(Operation::Execute).await;
    executed.sort();
    assert_eq!(executed, ids(&["b1", "b2", "b3"]));
}

#[tokio::test]
async fn test_scatter_all_sends_identical_raw_statement() {
    let (memory, dispatcher) = setup(&["a", "b"]);
    let request = Request::scatter_all("SELECT count(*) FROM users");

    dispatcher.dispatch(&request).await.unwrap();

    let journal = memory.journal().await;
    assert_eq!(journal.len(), 2);
    for call in &journal {
        assert_eq!(call.operation, Operation::Execute);
        assert_eq!(call.statement.as_deref(), Some("SELECT count(*) FROM users"));
    }
    let mut executed = memory.backends_for(Operation::Execute).await;
    executed.sort();
    assert_eq!(executed, ids(&["a", "b"]));
}

#[tokio::test]
async fn test_single_first_targets_lexicographically_first_backend() {
    let (memory, dispatcher) = setup(&["zeta", "alpha"]);
    memory.set_default_result("alpha", named_rows("alpha")).await;

    let result = dispatcher
        .dispatch(&Request::single_first("SELECT version()"))
        .await
        .unwrap();

    assert_eq!(memory.backends_for(Operation::Execute).await, ids(&["alpha"]));
    assert_eq!(result.rows, vec![vec![Value::Text("alpha".into())]]);
}

#[tokio::test]
async fn test_single_first_failure_is_overall_failure() {
    let (memory, dispatcher) = setup(&["zeta", "alpha"]);
    memory
        .fail("alpha", Operation::Execute, BackendError::Unreachable("reset by peer".into()))
        .await;

    match dispatcher.dispatch(&Request::single_first("SELECT 1")).await {
        Err(CoordinatorError::Dispatch(failure)) => {
            assert_eq!(failure.backends(), vec![&BackendId::from("alpha")]);
        }
        other => panic!("expected Dispatch error, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_every_failing_backend_is_reported() {
    let (memory, dispatcher) = setup(&["b1", "b2", "b3"]);
    memory
        .fail("b1", Operation::Execute, BackendError::Execution("relation does not exist".into()))
        .await;
    memory
        .fail("b3", Operation::Execute, BackendError::Unreachable("connection refused".into()))
        .await;
    memory
        .delay("b2", Operation::Execute, Duration::from_millis(500))
        .await;

    let request = Request::scatter_all("SELECT * FROM missing");
    let err = dispatcher.dispatch(&request).await.unwrap_err();

    let failure = match err {
        CoordinatorError::Dispatch(failure) => failure,
        other => panic!("expected Dispatch error, got {:?}", other),
    };
    assert_eq!(failure.backends(), vec![&BackendId::from("b1"), &BackendId::from("b3")]);
    assert_eq!(
        failure.error_for("b1").map(BackendError::kind),
        Some(BackendErrorKind::Execution)
    );
    assert_eq!(
        failure.error_for("b3").map(BackendError::kind),
        Some(BackendErrorKind::Unreachable)
    );
    assert!(failure.error_for("b2").is_none());
    // b2 was still invoked and allowed to finish.
    assert_eq!(memory.journal().await.len(), 3);
}

#[tokio::test]
async fn test_schema_mismatch_fails_dispatch() {
    let (memory, dispatcher) = setup(&["a", "b"]);
    memory.set_default_result("a", named_rows("a")).await;
    memory
        .set_default_result(
            "b",
            QueryResult::new(
                Schema::new(vec![Field::new("origin", DataType::Int, false)]),
                vec![vec![Value::Int(1)]],
            ),
        )
        .await;

    let err = dispatcher
        .dispatch(&Request::scatter_all("SELECT origin FROM t"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::SchemaMismatch { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_empty_normal_request_invokes_nothing() {
    let (memory, dispatcher) = setup(&["a"]);
    let result = dispatcher
        .dispatch(&Request::normal("SELECT 1 WHERE false", vec![]))
        .await
        .unwrap();
    assert!(result.rows.is_empty());
    assert!(memory.journal().await.is_empty());
}

#[tokio::test]
async fn test_duplicate_fragment_backend_rejected_before_invocation() {
    let (memory, dispatcher) = setup(&["a"]);
    let request = Request::normal(
        "DELETE FROM t",
        vec![
            Fragment::new("DELETE FROM t_0", "a", ""),
            Fragment::new("DELETE FROM t_1", "a", ""),
        ],
    );
    assert!(matches!(
        dispatcher.dispatch(&request).await,
        Err(CoordinatorError::InvalidRequest(_))
    ));
    assert!(memory.journal().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_cancels_in_flight_invocations() {
    let (memory, dispatcher) = setup(&["fast", "slow"]);
    memory
        .delay("slow", Operation::Execute, Duration::from_secs(60))
        .await;

    let request = Request::scatter_all("SELECT pg_sleep(60)").with_timeout(Duration::from_millis(100));
    let err = dispatcher.dispatch(&request).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::TimedOut), "{:?}", err);

    // The slow node's lock was released when its invocation unwound.
    memory
        .delay("slow", Operation::Execute, Duration::ZERO)
        .await;
    assert!(dispatcher
        .dispatch(&Request::scatter_all("SELECT 1"))
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_explicit_cancellation() {
    let (memory, dispatcher) = setup(&["a", "b"]);
    memory.delay("a", Operation::Execute, Duration::from_secs(10)).await;
    memory.delay("b", Operation::Execute, Duration::from_secs(10)).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = dispatcher
        .dispatch_with_cancel(&Request::scatter_all("VACUUM"), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Cancelled), "{:?}", err);
}

#[tokio::test]
async fn test_scatter_all_uses_injected_cluster_registry() {
    let memory = Arc::new(MemoryBackend::new(["s1", "s2", "s3"]));
    let registry = ClusterRegistry::new(30);
    registry.register(BackendId::from("s3"), "10.0.0.3:5432").await;
    registry.register(BackendId::from("s1"), "10.0.0.1:5432").await;

    let dispatcher = ScatterDispatcher::new(
        memory.clone(),
        Arc::new(registry),
        DispatchSettings::default(),
    );
    let result = dispatcher
        .dispatch(&Request::scatter_all("SELECT 1"))
        .await
        .unwrap();

    assert_eq!(result.sources, ids(&["s1", "s3"]));
    let mut executed = memory.backends_for(Operation::Execute).await;
    executed.sort();
    assert_eq!(executed, ids(&["s1", "s3"]));
}
