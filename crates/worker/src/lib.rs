//! In-process backend transport.
//!
//! [`MemoryBackend`] simulates a set of backend nodes behind the
//! [`BackendExecutor`] trait. Each node answers statements from a script,
//! keeps its own local transaction flag, and can be told to fail or stall any
//! operation. Every call is appended to a journal so callers can check which
//! backend saw what, and in which order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shardgate_common::{BackendError, BackendExecutor, BackendId, BackendResult, QueryResult};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Begin,
    Execute,
    Commit,
    Rollback,
}

/// One call received by a simulated backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub backend: BackendId,
    pub operation: Operation,
    /// Statement text, for [`Operation::Execute`] only.
    pub statement: Option<String>,
}

#[derive(Debug, Default)]
struct Node {
    results: HashMap<String, QueryResult>,
    default_result: QueryResult,
    failures: HashMap<Operation, BackendError>,
    delays: HashMap<Operation, Duration>,
    offline: bool,
    in_transaction: bool,
    commits: u64,
    rollbacks: u64,
}

impl Node {
    fn check(&self, operation: Operation) -> BackendResult<()> {
        if self.offline {
            return Err(BackendError::Unreachable("connection refused".to_string()));
        }
        match self.failures.get(&operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Simulated backend nodes keyed by id.
///
/// Calls for one node are serialized by that node's lock, which is held for
/// the whole call including any injected delay. Calls for different nodes run
/// independently.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    nodes: HashMap<BackendId, Arc<Mutex<Node>>>,
    journal: Mutex<Vec<Invocation>>,
}

impl MemoryBackend {
    pub fn new<I, B>(backends: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<BackendId>,
    {
        let nodes = backends
            .into_iter()
            .map(|id| (id.into(), Arc::new(Mutex::new(Node::default()))))
            .collect();
        Self {
            nodes,
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Scripts the result `backend` returns for `statement`.
    pub async fn set_result(&self, backend: &str, statement: &str, result: QueryResult) {
        if let Some(node) = self.nodes.get(backend) {
            node.lock().await.results.insert(statement.to_string(), result);
        }
    }

    /// Scripts the result `backend` returns for statements without their own script.
    pub async fn set_default_result(&self, backend: &str, result: QueryResult) {
        if let Some(node) = self.nodes.get(backend) {
            node.lock().await.default_result = result;
        }
    }

    /// Makes every `operation` on `backend` fail with `error` until cleared.
    pub async fn fail(&self, backend: &str, operation: Operation, error: BackendError) {
        if let Some(node) = self.nodes.get(backend) {
            node.lock().await.failures.insert(operation, error);
        }
    }

    pub async fn clear_failure(&self, backend: &str, operation: Operation) {
        if let Some(node) = self.nodes.get(backend) {
            node.lock().await.failures.remove(&operation);
        }
    }

    /// Makes every `operation` on `backend` take at least `delay`.
    pub async fn delay(&self, backend: &str, operation: Operation, delay: Duration) {
        if let Some(node) = self.nodes.get(backend) {
            node.lock().await.delays.insert(operation, delay);
        }
    }

    /// Marks `backend` unreachable for every operation.
    pub async fn set_offline(&self, backend: &str, offline: bool) {
        if let Some(node) = self.nodes.get(backend) {
            node.lock().await.offline = offline;
        }
    }

    pub async fn journal(&self) -> Vec<Invocation> {
        self.journal.lock().await.clone()
    }

    /// Backends that received `operation`, in arrival order.
    pub async fn backends_for(&self, operation: Operation) -> Vec<BackendId> {
        self.journal
            .lock()
            .await
            .iter()
            .filter(|call| call.operation == operation)
            .map(|call| call.backend.clone())
            .collect()
    }

    pub async fn in_transaction(&self, backend: &str) -> bool {
        match self.nodes.get(backend) {
            Some(node) => node.lock().await.in_transaction,
            None => false,
        }
    }

    /// Returns `(commits, rollbacks)` completed on `backend`.
    pub async fn outcomes(&self, backend: &str) -> (u64, u64) {
        match self.nodes.get(backend) {
            Some(node) => {
                let node = node.lock().await;
                (node.commits, node.rollbacks)
            }
            None => (0, 0),
        }
    }

    async fn record(&self, backend: &BackendId, operation: Operation, statement: Option<&str>) {
        self.journal.lock().await.push(Invocation {
            backend: backend.clone(),
            operation,
            statement: statement.map(str::to_string),
        });
    }

    fn node(&self, backend: &BackendId) -> BackendResult<Arc<Mutex<Node>>> {
        self.nodes
            .get(backend)
            .cloned()
            .ok_or_else(|| BackendError::Unreachable(format!("unknown backend {}", backend)))
    }
}

#[async_trait]
impl BackendExecutor for MemoryBackend {
    async fn execute(&self, backend: &BackendId, statement: &str) -> BackendResult<QueryResult> {
        self.record(backend, Operation::Execute, Some(statement)).await;
        let node = self.node(backend)?;
        let node = node.lock().await;
        if let Some(delay) = node.delays.get(&Operation::Execute) {
            sleep(*delay).await;
        }
        node.check(Operation::Execute)?;
        tracing::debug!(backend = %backend, statement, "memory backend executing");
        Ok(node
            .results
            .get(statement)
            .cloned()
            .unwrap_or_else(|| node.default_result.clone()))
    }

    async fn begin(&self, backend: &BackendId) -> BackendResult<()> {
        self.record(backend, Operation::Begin, None).await;
        let node = self.node(backend)?;
        let mut node = node.lock().await;
        if let Some(delay) = node.delays.get(&Operation::Begin) {
            sleep(*delay).await;
        }
        node.check(Operation::Begin)?;
        if node.in_transaction {
            return Err(BackendError::Execution(
                "there is already a transaction in progress".to_string(),
            ));
        }
        node.in_transaction = true;
        Ok(())
    }

    async fn commit(&self, backend: &BackendId) -> BackendResult<()> {
        self.record(backend, Operation::Commit, None).await;
        let node = self.node(backend)?;
        let mut node = node.lock().await;
        if let Some(delay) = node.delays.get(&Operation::Commit) {
            sleep(*delay).await;
        }
        node.check(Operation::Commit)?;
        if !node.in_transaction {
            return Err(BackendError::Execution(
                "there is no transaction in progress".to_string(),
            ));
        }
        node.in_transaction = false;
        node.commits += 1;
        Ok(())
    }

    async fn rollback(&self, backend: &BackendId) -> BackendResult<()> {
        self.record(backend, Operation::Rollback, None).await;
        let node = self.node(backend)?;
        let mut node = node.lock().await;
        if let Some(delay) = node.delays.get(&Operation::Rollback) {
            sleep(*delay).await;
        }
        node.check(Operation::Rollback)?;
        // Rolling back with no open transaction is a no-op on the node.
        if node.in_transaction {
            node.in_transaction = false;
            node.rollbacks += 1;
        }
        Ok(())
    }
}
