//! Postgres realization of the transaction factory and the job/work-row
//! operations (§6). This is the one concrete backend binding the workspace
//! ships; anything reachable only through the trait objects in [`crate::txn`]
//! and [`crate::performer`] stays backend-agnostic.
//!
//! Queries are built at runtime with `sqlx::query`/`query_as` rather than
//! the compile-time-checked `query!` macros, so the workspace builds
//! without a live database to check queries against.

use std::any::Any;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::error::{MeshQueueError, Result};
use crate::model::{Job, NodeInfo};
use crate::performer::JobRows;
use crate::queuer::QueuerStore;
use crate::txn::{Transaction, TransactionFactory};

fn backend(err: sqlx::Error) -> MeshQueueError {
    MeshQueueError::Backend(err.into())
}

/// An owned `sqlx` transaction. `Pool::begin` hands back a connection
/// checked out of the pool, so the transaction is `'static` and can be
/// stored behind `Box<dyn Transaction>` without self-reference tricks.
pub struct PgTransaction {
    inner: Option<sqlx::Transaction<'static, Postgres>>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.inner.take().expect("transaction used after completion").commit().await.map_err(backend)
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        self.inner.take().expect("transaction used after completion").rollback().await.map_err(backend)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl PgTransaction {
    /// Recovers the live connection from a generic `&mut dyn Transaction`.
    /// Panics if handed a transaction from a different backend — a
    /// programming error, since every `Queuer` is wired to exactly one
    /// `TransactionFactory` for its lifetime.
    pub(crate) fn conn(txn: &mut dyn Transaction) -> &mut sqlx::PgConnection {
        &mut *txn
            .as_any_mut()
            .downcast_mut::<PgTransaction>()
            .expect("expected a PgTransaction")
            .inner
            .as_mut()
            .expect("transaction used after completion")
    }
}

/// Supplies fresh transactions against a `PgPool`.
pub struct PgTransactionFactory {
    pool: PgPool,
}

impl PgTransactionFactory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionFactory for PgTransactionFactory {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let txn = self.pool.begin().await.map_err(backend)?;
        Ok(Box::new(PgTransaction { inner: Some(txn) }))
    }
}

/// `JOB`/`NODE_INFO` row operations against Postgres.
pub struct PgJobRows;

#[async_trait]
impl JobRows for PgJobRows {
    async fn load_for_update(&self, txn: &mut dyn Transaction, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT job_id, work_type, priority, weight, not_before, not_after \
             FROM job WHERE job_id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(PgTransaction::conn(txn))
        .await
        .map_err(backend)?;

        Ok(row.map(|row| Job {
            job_id: row.get("job_id"),
            work_type: row.get("work_type"),
            priority: row.get("priority"),
            weight: row.get("weight"),
            not_before: row.get("not_before"),
            not_after: row.get("not_after"),
        }))
    }

    async fn delete(&self, txn: &mut dyn Transaction, job_id: Uuid) -> Result<()> {
        // The work-type row carries `ON DELETE CASCADE` against `job_id`
        // (migrations/0002_job.sql), so deleting the JOB row removes both
        // in one statement (invariant ii: a work row never outlives its job).
        sqlx::query("DELETE FROM job WHERE job_id = $1")
            .bind(job_id)
            .execute(PgTransaction::conn(txn))
            .await
            .map_err(backend)?;
        Ok(())
    }
}

/// `NODE_INFO` and lost-work query operations against Postgres.
pub struct PgQueuerStore;

#[async_trait]
impl QueuerStore for PgQueuerStore {
    async fn select_lost_work(
        &self,
        txn: &mut dyn Transaction,
        now: DateTime<Utc>,
        queue_process_timeout: ChronoDuration,
    ) -> Result<Vec<Job>> {
        let horizon = now - queue_process_timeout;
        let rows = sqlx::query(
            "SELECT job_id, work_type, priority, weight, not_before, not_after \
             FROM job WHERE not_before < $1 OR not_before IS NULL \
             ORDER BY priority DESC, not_before ASC, job_id ASC",
        )
        .bind(horizon)
        .fetch_all(PgTransaction::conn(txn))
        .await
        .map_err(backend)?;

        Ok(rows
            .into_iter()
            .map(|row| Job {
                job_id: row.get("job_id"),
                work_type: row.get("work_type"),
                priority: row.get("priority"),
                weight: row.get("weight"),
                not_before: row.get("not_before"),
                not_after: row.get("not_after"),
            })
            .collect())
    }

    async fn upsert_node_info(&self, txn: &mut dyn Transaction, node: &NodeInfo) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_info (hostname, pid, port, time) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (hostname, port) DO UPDATE SET pid = EXCLUDED.pid, time = EXCLUDED.time",
        )
        .bind(&node.hostname)
        .bind(node.pid)
        .bind(node.port)
        .bind(node.time)
        .execute(PgTransaction::conn(txn))
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn delete_node_info(&self, txn: &mut dyn Transaction, node: &NodeInfo) -> Result<()> {
        sqlx::query("DELETE FROM node_info WHERE hostname = $1 AND port = $2")
            .bind(&node.hostname)
            .bind(node.port)
            .execute(PgTransaction::conn(txn))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn active_nodes(&self, txn: &mut dyn Transaction) -> Result<Vec<NodeInfo>> {
        let rows = sqlx::query("SELECT hostname, pid, port, time FROM node_info ORDER BY hostname, port")
            .fetch_all(PgTransaction::conn(txn))
            .await
            .map_err(backend)?;

        Ok(rows
            .into_iter()
            .map(|row| NodeInfo {
                hostname: row.get("hostname"),
                pid: row.get("pid"),
                port: row.get("port"),
                time: row.get("time"),
            })
            .collect())
    }
}
