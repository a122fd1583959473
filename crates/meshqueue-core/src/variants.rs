//! Variant queuers (§4.8): trivial enqueue surfaces for single-process mode
//! and for tests/read-only clients, alongside the full [`crate::queuer::Queuer`].
//!
//! Both expose the same `enqueue_work` signature as `Queuer` and inherit its
//! proposal-callback mechanism, but differ in how (or whether) the job is
//! ever run locally:
//! - [`LocalQueuer`] always runs the job on this process via [`LocalPerformer`],
//!   skipping the worker-pool/peer-fabric decision entirely.
//! - [`NonPerformingQueuer`] never runs the job itself; its `whenExecuted`
//!   fires as soon as the timer would have fired, leaving the row for
//!   another node's lost-work scan to actually perform.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::{delay_until, SharedClock};
use crate::error::Result;
use crate::performer::{LocalPerformer, Performer};
use crate::proposal::{ExecutedOutcome, Proposal, ProposalCallback, StageOutcome};
use crate::registry::{insert_via_factory, WorkTypeRegistry};
use crate::txn::Transaction;

/// `performJob` is a no-op returning success. Useful as a bare [`Performer`]
/// in tests that only care about whether something was *asked* to run a job.
#[derive(Default)]
pub struct NoOpPerformer;

#[async_trait::async_trait]
impl Performer for NoOpPerformer {
    async fn perform_job(&self, _job_id: Uuid) -> Result<()> {
        Ok(())
    }
}

/// Same enqueue surface as `Queuer`, but `choosePerformer` always returns a
/// `LocalPerformer` — no worker pool, no peer fabric. Used in single-process
/// mode where there is nothing else to delegate to.
pub struct LocalQueuer {
    clock: SharedClock,
    registry: Arc<WorkTypeRegistry>,
    local_performer: Arc<LocalPerformer>,
    proposal_callback: Mutex<Option<ProposalCallback>>,
}

impl LocalQueuer {
    pub fn new(clock: SharedClock, registry: Arc<WorkTypeRegistry>, local_performer: Arc<LocalPerformer>) -> Self {
        Self {
            clock,
            registry,
            local_performer,
            proposal_callback: Mutex::new(None),
        }
    }

    pub async fn on_proposal(&self, callback: ProposalCallback) {
        *self.proposal_callback.lock().await = Some(callback);
    }

    pub async fn enqueue_work(
        self: &Arc<Self>,
        txn: &mut dyn Transaction,
        work_type: &str,
        attrs: Value,
    ) -> Result<Proposal> {
        let job = insert_via_factory(&self.registry, txn, work_type, attrs).await?;
        let proposal = Proposal::new(job.job_id);
        proposal.fire_proposed(StageOutcome::Ok);

        if let Some(callback) = self.proposal_callback.lock().await.as_ref() {
            callback(&proposal);
        }

        let delay = delay_until(self.clock.as_ref(), job.not_before);
        let this = self.clone();
        let job_id = job.job_id;
        let clock = self.clock.clone();
        let proposal_for_task = proposal.clone();
        tokio::spawn(async move {
            if clock.sleep(delay).await.is_err() {
                return;
            }
            if let StageOutcome::Aborted = proposal_for_task.when_committed().await {
                return;
            }
            match this.local_performer.perform_job(job_id).await {
                Ok(()) => proposal_for_task.fire_executed(ExecutedOutcome::Ok),
                Err(err) if !err.leaves_job_for_retry() => {
                    proposal_for_task.fire_executed(ExecutedOutcome::Ok)
                }
                Err(_) => {}
            }
        });

        Ok(proposal)
    }

    pub fn notify_enclosing_transaction(&self, proposal: &Proposal, committed: bool) {
        proposal.fire_committed(if committed {
            StageOutcome::Ok
        } else {
            StageOutcome::Aborted
        });
    }
}

/// Same enqueue surface again, but never performs the job itself: the row is
/// inserted and the timer fires `whenExecuted` immediately with `Ok`,
/// leaving actual execution to whichever cluster member's lost-work scan
/// picks the row up next. Used in test fixtures that only want to assert on
/// the insert, and by read-only clients that enqueue but never execute.
pub struct NonPerformingQueuer {
    clock: SharedClock,
    registry: Arc<WorkTypeRegistry>,
    proposal_callback: Mutex<Option<ProposalCallback>>,
}

impl NonPerformingQueuer {
    pub fn new(clock: SharedClock, registry: Arc<WorkTypeRegistry>) -> Self {
        Self {
            clock,
            registry,
            proposal_callback: Mutex::new(None),
        }
    }

    pub async fn on_proposal(&self, callback: ProposalCallback) {
        *self.proposal_callback.lock().await = Some(callback);
    }

    pub async fn enqueue_work(
        self: &Arc<Self>,
        txn: &mut dyn Transaction,
        work_type: &str,
        attrs: Value,
    ) -> Result<Proposal> {
        let job = insert_via_factory(&self.registry, txn, work_type, attrs).await?;
        let proposal = Proposal::new(job.job_id);
        proposal.fire_proposed(StageOutcome::Ok);

        if let Some(callback) = self.proposal_callback.lock().await.as_ref() {
            callback(&proposal);
        }

        let delay = delay_until(self.clock.as_ref(), job.not_before);
        let clock = self.clock.clone();
        let proposal_for_task = proposal.clone();
        tokio::spawn(async move {
            if clock.sleep(delay).await.is_err() {
                return;
            }
            if let StageOutcome::Aborted = proposal_for_task.when_committed().await {
                return;
            }
            // NoOpPerformer::perform_job always succeeds; the row is left
            // in place for another node's lost-work scan.
            proposal_for_task.fire_executed(ExecutedOutcome::Ok);
        });

        Ok(proposal)
    }

    pub fn notify_enclosing_transaction(&self, proposal: &Proposal, committed: bool) {
        proposal.fire_committed(if committed {
            StageOutcome::Ok
        } else {
            StageOutcome::Aborted
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::TestClock;
    use crate::model::Job;
    use crate::performer::JobRows;
    use crate::registry::WorkTypeHandlers;
    use crate::txn::testing::InMemoryTransactionFactory;
    use crate::txn::{in_transaction, SharedTransactionFactory};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dummy_registry() -> Arc<WorkTypeRegistry> {
        let mut registry = WorkTypeRegistry::new();
        registry.register(
            "noop",
            WorkTypeHandlers {
                loader: Arc::new(|_txn, _job_id| {
                    Box::pin(async { Ok(Some(Arc::new(NoOpWork) as Arc<dyn crate::model::WorkItem>)) })
                }),
                factory: Arc::new(|_txn, _attrs| {
                    Box::pin(async { Ok((Job::new("noop"), Arc::new(NoOpWork) as Arc<dyn crate::model::WorkItem>)) })
                }),
            },
        );
        Arc::new(registry)
    }

    /// A registry whose factory always inserts the same fixed job id, so a
    /// `JobRows` double can be pre-seeded with the matching row before the
    /// scheduled execution ever runs — avoiding a race between the test
    /// setting up the row and the spawned task looking it up.
    fn fixed_id_registry(job_id: Uuid) -> Arc<WorkTypeRegistry> {
        let mut registry = WorkTypeRegistry::new();
        registry.register(
            "noop",
            WorkTypeHandlers {
                loader: Arc::new(|_txn, _job_id| {
                    Box::pin(async { Ok(Some(Arc::new(NoOpWork) as Arc<dyn crate::model::WorkItem>)) })
                }),
                factory: Arc::new(move |_txn, _attrs| {
                    let mut job = Job::new("noop");
                    job.job_id = job_id;
                    Box::pin(async move { Ok((job, Arc::new(NoOpWork) as Arc<dyn crate::model::WorkItem>)) })
                }),
            },
        );
        Arc::new(registry)
    }

    struct NoOpWork;
    static RAN: AtomicUsize = AtomicUsize::new(0);
    #[async_trait::async_trait]
    impl crate::model::WorkItem for NoOpWork {
        async fn do_work(&self, _txn: &mut dyn Transaction) -> anyhow::Result<()> {
            RAN.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Hands back `job` exactly once, then reports it gone, mirroring the
    /// real lifecycle: a job is loadable until the performer deletes it.
    struct OneShotJobRows {
        job: tokio::sync::Mutex<Option<Job>>,
        deletes: AtomicUsize,
    }
    #[async_trait::async_trait]
    impl JobRows for OneShotJobRows {
        async fn load_for_update(&self, _txn: &mut dyn Transaction, job_id: Uuid) -> Result<Option<Job>> {
            Ok(self.job.lock().await.clone().filter(|j| j.job_id == job_id))
        }
        async fn delete(&self, _txn: &mut dyn Transaction, _job_id: Uuid) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            *self.job.lock().await = None;
            Ok(())
        }
    }

    #[tokio::test]
    async fn non_performing_queuer_fires_executed_without_running_work() {
        let clock = TestClock::new(Utc::now());
        let registry = dummy_registry();
        let queuer = Arc::new(NonPerformingQueuer::new(clock, registry));
        let txn_factory: SharedTransactionFactory = Arc::new(InMemoryTransactionFactory::default());

        let proposal = in_transaction(txn_factory.as_ref(), |txn| {
            let queuer = queuer.clone();
            Box::pin(async move { queuer.enqueue_work(txn, "noop", Value::Null).await })
        })
        .await
        .unwrap();
        queuer.notify_enclosing_transaction(&proposal, true);

        let outcome = proposal.when_executed().await;
        assert!(matches!(outcome, ExecutedOutcome::Ok));
    }

    #[tokio::test]
    async fn local_queuer_runs_job_via_local_performer() {
        let clock = TestClock::new(Utc::now());
        let job_id = Uuid::new_v4();
        let registry = fixed_id_registry(job_id);
        let txn_factory: SharedTransactionFactory = Arc::new(InMemoryTransactionFactory::default());
        let mut seed_job = Job::new("noop");
        seed_job.job_id = job_id;
        let rows = Arc::new(OneShotJobRows {
            job: tokio::sync::Mutex::new(Some(seed_job)),
            deletes: AtomicUsize::new(0),
        });
        let local_performer = Arc::new(LocalPerformer::new(
            txn_factory.clone(),
            rows.clone(),
            registry.clone(),
            clock.clone(),
        ));
        let queuer = Arc::new(LocalQueuer::new(clock, registry, local_performer));

        let before = RAN.load(Ordering::SeqCst);
        let proposal = in_transaction(txn_factory.as_ref(), |txn| {
            let queuer = queuer.clone();
            Box::pin(async move { queuer.enqueue_work(txn, "noop", Value::Null).await })
        })
        .await
        .unwrap();
        queuer.notify_enclosing_transaction(&proposal, true);

        let outcome = proposal.when_executed().await;
        assert!(matches!(outcome, ExecutedOutcome::Ok));
        assert_eq!(RAN.load(Ordering::SeqCst), before + 1);
        assert_eq!(rows.deletes.load(Ordering::SeqCst), 1);
        assert!(rows.job.lock().await.is_none());
    }

    #[tokio::test]
    async fn aborted_enclosing_transaction_skips_execution() {
        let clock = TestClock::new(Utc::now());
        let registry = dummy_registry();
        let queuer = Arc::new(NonPerformingQueuer::new(clock, registry));
        let txn_factory: SharedTransactionFactory = Arc::new(InMemoryTransactionFactory::default());

        let proposal = in_transaction(txn_factory.as_ref(), |txn| {
            let queuer = queuer.clone();
            Box::pin(async move { queuer.enqueue_work(txn, "noop", Value::Null).await })
        })
        .await
        .unwrap();
        queuer.notify_enclosing_transaction(&proposal, false);

        let outcome = proposal.when_executed().await;
        assert!(matches!(outcome, ExecutedOutcome::EnqueueAborted));
    }
}
