//! The performer capability and the local performer (§4.4).
//!
//! Any object with `perform_job(job_id) -> ()` is a performer; there are
//! three variants (local, worker-pool, peer-connection — §4.5–§4.7). This
//! module defines the trait and the simplest implementation, which runs
//! `doWork` on the controller itself.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{MeshQueueError, Result};
use crate::model::Job;
use crate::registry::WorkTypeRegistry;
use crate::txn::{in_transaction, SharedTransactionFactory, Transaction};

/// Anything that can be asked to run a job by id. Local, worker-pool, and
/// peer-connection implementations all satisfy this.
#[async_trait]
pub trait Performer: Send + Sync {
    async fn perform_job(&self, job_id: Uuid) -> Result<()>;
}

/// Persistence operations the local performer needs from the storage
/// backend: loading the job row under a row lock, and deleting both rows
/// on success. Kept separate from [`crate::txn::Transaction`] because these
/// are job-table-specific, not generic transaction control.
#[async_trait]
pub trait JobRows: Send + Sync {
    /// `SELECT ... FOR UPDATE` the job row. `Ok(None)` means the row is
    /// already gone — the no-op success case from §4.4.
    async fn load_for_update(
        &self,
        txn: &mut dyn Transaction,
        job_id: Uuid,
    ) -> Result<Option<Job>>;

    /// Deletes the job row and its work-type row in the same transaction.
    async fn delete(&self, txn: &mut dyn Transaction, job_id: Uuid) -> Result<()>;
}

/// Given a `jobID`, opens a new transaction, locks the job row, resolves
/// its work type, runs `doWork`, deletes both rows, and commits. A job
/// loaded past its `not_after` is deleted without running `doWork`.
pub struct LocalPerformer {
    txn_factory: SharedTransactionFactory,
    rows: Arc<dyn JobRows>,
    registry: Arc<WorkTypeRegistry>,
    clock: SharedClock,
}

impl LocalPerformer {
    pub fn new(
        txn_factory: SharedTransactionFactory,
        rows: Arc<dyn JobRows>,
        registry: Arc<WorkTypeRegistry>,
        clock: SharedClock,
    ) -> Self {
        Self {
            txn_factory,
            rows,
            registry,
            clock,
        }
    }
}

#[async_trait]
impl Performer for LocalPerformer {
    async fn perform_job(&self, job_id: Uuid) -> Result<()> {
        let rows = self.rows.clone();
        let registry = self.registry.clone();
        let now = self.clock.now();

        let outcome = in_transaction(self.txn_factory.as_ref(), move |txn| {
            let rows = rows.clone();
            let registry = registry.clone();
            Box::pin(async move {
                let job = match rows.load_for_update(txn, job_id).await? {
                    Some(job) => job,
                    None => {
                        // Deleted concurrently, or already claimed by
                        // another node. Designed behavior, not an error.
                        return Ok(PerformOutcome::RowGone);
                    }
                };

                if job.is_expired(now) {
                    // Past not_after: consumed without ever running doWork.
                    rows.delete(txn, job_id).await?;
                    return Ok(PerformOutcome::Expired);
                }

                let handlers = registry.get(&job.work_type)?;
                let work_item = match (handlers.loader)(txn, job_id).await? {
                    Some(item) => item,
                    None => {
                        // The work row itself lost a race (seed scenario 7):
                        // clean up the now-dangling job row so it doesn't
                        // linger for the next lost-work scan to rediscover.
                        rows.delete(txn, job_id).await?;
                        return Ok(PerformOutcome::RowGone);
                    }
                };

                match work_item.do_work(txn).await {
                    Ok(()) => {
                        rows.delete(txn, job_id).await?;
                        Ok(PerformOutcome::Succeeded)
                    }
                    Err(domain_err) => {
                        // doWork failed with a domain error: the job is
                        // consumed regardless, per §4.1's contract.
                        rows.delete(txn, job_id).await?;
                        Ok(PerformOutcome::DomainFailed(domain_err))
                    }
                }
            })
        })
        .await?;

        match outcome {
            PerformOutcome::Succeeded => {
                info!(job_id = %job_id, "job succeeded");
                Ok(())
            }
            PerformOutcome::RowGone => {
                info!(job_id = %job_id, "job row gone, treating as no-op success");
                Ok(())
            }
            PerformOutcome::Expired => {
                warn!(job_id = %job_id, "job expired past not_after, consumed without running");
                Err(MeshQueueError::Expired(job_id))
            }
            PerformOutcome::DomainFailed(err) => {
                warn!(job_id = %job_id, error = %err, "work failed, job consumed");
                Err(MeshQueueError::WorkFailed(err))
            }
        }
    }
}

enum PerformOutcome {
    Succeeded,
    RowGone,
    Expired,
    DomainFailed(anyhow::Error),
}
