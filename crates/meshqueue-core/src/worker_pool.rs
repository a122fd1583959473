//! Worker connection pool (§4.5).
//!
//! Per node, a set of connections from sibling *worker* processes that have
//! dialled in. Wire-level dialogue with an actual worker process is
//! abstracted behind [`WorkerLink`]; the pool itself only manages load
//! bookkeeping and selection, mirroring how `kernel/jobs/worker.rs`'s
//! `running_jobs: Arc<RwLock<HashMap<...>>>` separates accounting from
//! the transport.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{MeshQueueError, Result};
use crate::performer::Performer;

/// A live wire connection to one worker process. Implemented over whatever
/// transport carries `PerformJob` (§6); `rpc::WorkerClient` is the `tonic`
/// realization.
#[async_trait]
pub trait WorkerLink: Send + Sync {
    async fn perform_job(&self, job_id: Uuid) -> Result<()>;
}

struct WorkerConnection {
    id: u64,
    link: Arc<dyn WorkerLink>,
    current_load: AtomicI64,
}

/// Default max in-flight jobs per worker before it's considered saturated.
pub const DEFAULT_MAX_LOAD_PER_WORKER: i64 = 8;

/// Set of connections from sibling worker processes. Implements the
/// performer capability by selecting the least-loaded connection.
pub struct WorkerConnectionPool {
    connections: RwLock<Vec<Arc<WorkerConnection>>>,
    next_id: AtomicU64,
    max_load_per_worker: i64,
}

impl WorkerConnectionPool {
    pub fn new(max_load_per_worker: i64) -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            max_load_per_worker,
        }
    }

    /// Registers a newly dialled-in worker connection.
    pub async fn add_connection(&self, link: Arc<dyn WorkerLink>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.connections.write().await.push(Arc::new(WorkerConnection {
            id,
            link,
            current_load: AtomicI64::new(0),
        }));
        id
    }

    /// Removes a connection by id, e.g. on disconnect. Outstanding
    /// `performJob` calls on it fail independently; the lost-work scan
    /// recovers the jobs (§7).
    pub async fn remove_connection(&self, id: u64) {
        self.connections.write().await.retain(|c| c.id != id);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// True iff at least one worker is connected and at least one worker's
    /// load is below `max_load_per_worker`.
    pub async fn has_available_capacity(&self) -> bool {
        let connections = self.connections.read().await;
        connections
            .iter()
            .any(|c| c.current_load.load(Ordering::SeqCst) < self.max_load_per_worker)
    }

    /// Selects the connection with the minimum current load, ties broken by
    /// insertion order (the vec preserves insertion order; the first match
    /// in iteration order wins).
    async fn least_loaded(&self) -> Option<Arc<WorkerConnection>> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .min_by_key(|c| c.current_load.load(Ordering::SeqCst))
            .cloned()
    }
}

#[async_trait]
impl Performer for WorkerConnectionPool {
    async fn perform_job(&self, job_id: Uuid) -> Result<()> {
        let conn = self
            .least_loaded()
            .await
            .ok_or_else(|| MeshQueueError::ConnectionLost("no workers connected".into()))?;

        conn.current_load.fetch_add(1, Ordering::SeqCst);
        let result = conn.link.perform_job(job_id).await;
        conn.current_load.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubWorker {
        fail: bool,
    }

    #[async_trait]
    impl WorkerLink for StubWorker {
        async fn perform_job(&self, _job_id: Uuid) -> Result<()> {
            if self.fail {
                Err(MeshQueueError::ConnectionLost("stub failure".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn no_workers_has_no_capacity() {
        let pool = WorkerConnectionPool::new(DEFAULT_MAX_LOAD_PER_WORKER);
        assert!(!pool.has_available_capacity().await);
    }

    #[tokio::test]
    async fn selects_idle_worker_over_busy_one() {
        let pool = WorkerConnectionPool::new(DEFAULT_MAX_LOAD_PER_WORKER);
        let busy = Arc::new(StubWorker { fail: false });
        let idle = Arc::new(StubWorker { fail: false });
        let busy_id = pool.add_connection(busy).await;
        pool.add_connection(idle).await;

        // Simulate worker 1 already having load 1 (seed scenario 8).
        {
            let conns = pool.connections.read().await;
            let busy_conn = conns.iter().find(|c| c.id == busy_id).unwrap();
            busy_conn.current_load.store(1, Ordering::SeqCst);
        }

        let chosen = pool.least_loaded().await.unwrap();
        assert_ne!(chosen.id, busy_id);
    }

    #[tokio::test]
    async fn disconnect_removes_worker() {
        let pool = WorkerConnectionPool::new(DEFAULT_MAX_LOAD_PER_WORKER);
        let id = pool.add_connection(Arc::new(StubWorker { fail: false })).await;
        assert_eq!(pool.connection_count().await, 1);
        pool.remove_connection(id).await;
        assert_eq!(pool.connection_count().await, 0);
    }

    #[tokio::test]
    async fn perform_job_propagates_worker_failure() {
        let pool = WorkerConnectionPool::new(DEFAULT_MAX_LOAD_PER_WORKER);
        pool.add_connection(Arc::new(StubWorker { fail: true })).await;
        let result = pool.perform_job(Uuid::new_v4()).await;
        assert!(matches!(result, Err(MeshQueueError::ConnectionLost(_))));
    }
}
