//! Seams between the coordinator and the outside world.
//!
//! [`BackendExecutor`] is implemented once per transport by the driver layer.
//! Calls for distinct backends may be issued concurrently; implementations
//! serialize calls that target the same backend.

use async_trait::async_trait;

use crate::error::BackendResult;
use crate::request::BackendId;
use crate::result::QueryResult;

#[async_trait]
pub trait BackendExecutor: Send + Sync {
    /// Runs one statement on `backend`.
    async fn execute(&self, backend: &BackendId, statement: &str) -> BackendResult<QueryResult>;

    /// Opens a backend-local transaction.
    async fn begin(&self, backend: &BackendId) -> BackendResult<()>;

    async fn commit(&self, backend: &BackendId) -> BackendResult<()>;

    async fn rollback(&self, backend: &BackendId) -> BackendResult<()>;
}

/// Source of the currently reachable backend identifiers.
///
/// Owned outside the coordinator and injected into it; the coordinator does
/// no health checking of its own.
#[async_trait]
pub trait BackendRegistry: Send + Sync {
    async fn live_backends(&self) -> Vec<BackendId>;
}

/// Registry over a fixed backend list.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    backends: Vec<BackendId>,
}

impl StaticRegistry {
    pub fn new<I, B>(backends: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<BackendId>,
    {
        Self {
            backends: backends.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl BackendRegistry for StaticRegistry {
    async fn live_backends(&self) -> Vec<BackendId> {
        self.backends.clone()
    }
}
