//! Heartbeat-driven registry of live backends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shardgate_common::{BackendId, BackendRegistry};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct BackendState {
    pub address: String,
    /// Unix timestamp (seconds) of the last registration or heartbeat.
    pub last_seen: i64,
}

pub type ClusterState = Arc<RwLock<HashMap<BackendId, BackendState>>>;

/// Backends that registered and keep sending heartbeats.
///
/// A backend counts as live while its last heartbeat is newer than the
/// configured timeout. Stale entries are dropped by [`ClusterRegistry::prune`].
#[derive(Debug, Clone)]
pub struct ClusterRegistry {
    cluster: ClusterState,
    backend_timeout_secs: i64,
}

impl ClusterRegistry {
    pub fn new(backend_timeout_secs: i64) -> Self {
        Self {
            cluster: Arc::new(RwLock::new(HashMap::new())),
            backend_timeout_secs,
        }
    }

    pub fn state(&self) -> ClusterState {
        self.cluster.clone()
    }

    pub async fn register(&self, backend: BackendId, address: impl Into<String>) {
        let address = address.into();
        tracing::info!(backend = %backend, address = %address, "registered backend");
        self.cluster.write().await.insert(
            backend,
            BackendState {
                address,
                last_seen: Utc::now().timestamp(),
            },
        );
    }

    /// Refreshes `backend`. Returns `false` if it never registered.
    pub async fn heartbeat(&self, backend: &BackendId) -> bool {
        let mut cluster = self.cluster.write().await;
        match cluster.get_mut(backend) {
            Some(state) => {
                state.last_seen = Utc::now().timestamp();
                tracing::trace!(backend = %backend, "heartbeat");
                true
            }
            None => {
                tracing::warn!(backend = %backend, "heartbeat from unregistered backend");
                false
            }
        }
    }

    pub async fn deregister(&self, backend: &BackendId) -> bool {
        self.cluster.write().await.remove(backend).is_some()
    }

    /// Drops backends whose last heartbeat is older than the timeout at `now`.
    /// Returns the removed ids.
    pub async fn prune(&self, now: i64) -> Vec<BackendId> {
        let mut cluster = self.cluster.write().await;
        let stale: Vec<BackendId> = cluster
            .iter()
            .filter(|(_, state)| now - state.last_seen > self.backend_timeout_secs)
            .map(|(id, _)| id.clone())
            .collect();
        for backend in &stale {
            cluster.remove(backend);
            tracing::warn!(backend = %backend, "pruned backend after missed heartbeats");
        }
        stale
    }

    /// Runs [`ClusterRegistry::prune`] every `interval` until `shutdown` fires.
    pub fn spawn_pruner(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.prune(Utc::now().timestamp()).await;
                    }
                }
            }
            tracing::debug!("registry pruner stopped");
        })
    }
}

#[async_trait]
impl BackendRegistry for ClusterRegistry {
    async fn live_backends(&self) -> Vec<BackendId> {
        let now = Utc::now().timestamp();
        self.cluster
            .read()
            .await
            .iter()
            .filter(|(_, state)| now - state.last_seen <= self.backend_timeout_secs)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
