//! The queuer: the top-level coordination service (§4.7).
//!
//! Chooses a performer per job, runs the periodic lost-work scan, registers
//! node presence, and is the sole public entry point for enqueue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::{delay_until, SharedClock};
use crate::error::{MeshQueueError, Result};
use crate::model::{Job, NodeInfo};
use crate::peer_fabric::PeerFabric;
use crate::performer::{JobRows, LocalPerformer, Performer};
use crate::proposal::{ExecutedOutcome, Proposal, ProposalCallback, StageOutcome};
use crate::registry::{insert_via_factory, WorkTypeRegistry};
use crate::txn::{in_transaction, SharedTransactionFactory, Transaction};
use crate::worker_pool::WorkerConnectionPool;

/// Persistence operations the queuer needs beyond what `JobRows` covers:
/// inserting via the work-type factory, the lost-work query, and node
/// presence bookkeeping.
#[async_trait::async_trait]
pub trait QueuerStore: Send + Sync {
    /// Selects all JOB rows past due by more than `queue_process_timeout`,
    /// ordered `(priority desc, not_before asc, job_id asc)` (§4.7).
    async fn select_lost_work(
        &self,
        txn: &mut dyn Transaction,
        now: DateTime<Utc>,
        queue_process_timeout: ChronoDuration,
    ) -> Result<Vec<Job>>;

    async fn upsert_node_info(&self, txn: &mut dyn Transaction, node: &NodeInfo) -> Result<()>;
    async fn delete_node_info(&self, txn: &mut dyn Transaction, node: &NodeInfo) -> Result<()>;
    async fn active_nodes(&self, txn: &mut dyn Transaction) -> Result<Vec<NodeInfo>>;
}

pub struct QueuerConfig {
    pub hostname: String,
    pub pid: i32,
    pub listen_port: i32,
    pub queue_process_timeout: ChronoDuration,
}

/// The top-level coordination service. Owns the worker pool and peer
/// fabric, and is the sole entry point applications call to enqueue work.
pub struct Queuer {
    config: QueuerConfig,
    clock: SharedClock,
    txn_factory: SharedTransactionFactory,
    registry: Arc<WorkTypeRegistry>,
    job_rows: Arc<dyn JobRows>,
    store: Arc<dyn QueuerStore>,
    worker_pool: Arc<WorkerConnectionPool>,
    peer_fabric: Arc<PeerFabric>,
    local_performer: Arc<LocalPerformer>,
    started: AtomicBool,
    proposal_callback: Mutex<Option<ProposalCallback>>,
}

impl Queuer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: QueuerConfig,
        clock: SharedClock,
        txn_factory: SharedTransactionFactory,
        registry: Arc<WorkTypeRegistry>,
        job_rows: Arc<dyn JobRows>,
        store: Arc<dyn QueuerStore>,
        worker_pool: Arc<WorkerConnectionPool>,
        peer_fabric: Arc<PeerFabric>,
    ) -> Self {
        let local_performer = Arc::new(LocalPerformer::new(
            txn_factory.clone(),
            job_rows.clone(),
            registry.clone(),
            clock.clone(),
        ));
        Self {
            config,
            clock,
            txn_factory,
            registry,
            job_rows,
            store,
            worker_pool,
            peer_fabric,
            local_performer,
            started: AtomicBool::new(false),
            proposal_callback: Mutex::new(None),
        }
    }

    /// Registers a callback invoked with every new `Proposal` this queuer
    /// creates (§4.8).
    pub async fn on_proposal(&self, callback: ProposalCallback) {
        *self.proposal_callback.lock().await = Some(callback);
    }

    /// The worker connection pool this queuer dispatches to. Exposed so the
    /// node binary can bind it to a listening `tonic` server.
    pub fn worker_pool(&self) -> Arc<WorkerConnectionPool> {
        self.worker_pool.clone()
    }

    /// The peer fabric this queuer relays to. Exposed so the node binary's
    /// discovery loop can reconcile connections against `NODE_INFO`.
    pub fn peer_fabric(&self) -> Arc<PeerFabric> {
        self.peer_fabric.clone()
    }

    pub fn config(&self) -> &QueuerConfig {
        &self.config
    }

    /// Decision order from §4.7: local worker pool if it has capacity, else
    /// the least-loaded peer (unless `only_locally`), else the local
    /// performer.
    pub async fn choose_performer(&self, only_locally: bool) -> Arc<dyn Performer> {
        if self.worker_pool.has_available_capacity().await {
            return self.worker_pool.clone();
        }
        if !only_locally {
            if self.peer_fabric.connection_count().await > 0 {
                return self.peer_fabric.clone();
            }
        }
        self.local_performer.clone()
    }

    /// Inserts the job and work rows via the work-type factory inside
    /// `txn`, schedules the in-process timer, and returns a bound
    /// `Proposal`. `attrs` must match the work-type's registered columns;
    /// unknown keys fail synchronously with a schema error.
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

        self.schedule_execution(job, proposal.clone());
        Ok(proposal)
    }

    /// Called once `enqueueWork`'s enclosing transaction has resolved, to
    /// fire `whenCommitted` and arm the timer. Applications call this from
    /// their own commit hook since the core has no visibility into the
    /// caller's transaction lifecycle (§4.3).
    pub fn notify_enclosing_transaction(&self, proposal: &Proposal, committed: bool) {
        proposal.fire_committed(if committed {
            StageOutcome::Ok
        } else {
            StageOutcome::Aborted
        });
    }

    fn schedule_execution(self: &Arc<Self>, job: Job, proposal: Proposal) {
        let delay = delay_until(self.clock.as_ref(), job.not_before);
        let this = self.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            if clock.sleep(delay).await.is_err() {
                return;
            }
            // Wait for the enclosing transaction's outcome before acting;
            // if it aborted, whenExecuted already failed via fire_committed.
            if let StageOutcome::Aborted = proposal.when_committed().await {
                return;
            }
            let performer = this.choose_performer(false).await;
            match performer.perform_job(job.job_id).await {
                Ok(()) => proposal.fire_executed(ExecutedOutcome::Ok),
                Err(err) => {
                    warn!(job_id = %job.job_id, error = %err, "scheduled execution failed");
                    if !err.leaves_job_for_retry() {
                        proposal.fire_executed(ExecutedOutcome::Ok);
                    }
                    // Backend/connection failures leave the row for the
                    // lost-work scan; whenExecuted is left unfulfilled
                    // until the scan re-drives it.
                }
            }
        });
    }

    /// Idempotent per instance; a second call is an error.
    pub async fn start_service(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MeshQueueError::AlreadyStarted);
        }

        let node = self.node_info();
        let store = self.store.clone();
        let node_for_upsert = node.clone();
        in_transaction(self.txn_factory.as_ref(), move |txn| {
            let store = store.clone();
            let node = node_for_upsert.clone();
            Box::pin(async move { store.upsert_node_info(txn, &node).await })
        })
        .await?;

        info!(hostname = %node.hostname, port = node.port, "node registered");

        let this = self.clone();
        tokio::spawn(async move {
            this.run_lost_work_loop().await;
        });

        Ok(())
    }

    /// Removes the node row and tears down connections. Waits for
    /// in-flight executions to complete or be abandoned (callers drive the
    /// timeout via their own shutdown token).
    pub async fn stop_service(&self) -> Result<()> {
        let node = self.node_info();
        let store = self.store.clone();
        in_transaction(self.txn_factory.as_ref(), move |txn| {
            let store = store.clone();
            let node = node.clone();
            Box::pin(async move { store.delete_node_info(txn, &node).await })
        })
        .await?;
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn active_nodes(&self) -> Result<Vec<NodeInfo>> {
        let store = self.store.clone();
        in_transaction(self.txn_factory.as_ref(), move |txn| {
            let store = store.clone();
            Box::pin(async move { store.active_nodes(txn).await })
        })
        .await
    }

    fn node_info(&self) -> NodeInfo {
        NodeInfo {
            hostname: self.config.hostname.clone(),
            pid: self.config.pid,
            port: self.config.listen_port,
            time: self.clock.now(),
        }
    }

    async fn run_lost_work_loop(self: Arc<Self>) {
        loop {
            if self.clock.sleep(to_std(self.config.queue_process_timeout)).await.is_err() {
                return;
            }
            if !self.started.load(Ordering::SeqCst) {
                return;
            }
            self.periodic_lost_work_check().await;
        }
    }

    /// Runs one lost-work scan tick synchronously, without waiting for
    /// `queue_process_timeout` to elapse. Lets integration tests exercise
    /// seed scenarios 4/5 deterministically instead of racing the real
    /// scan interval.
    #[cfg(any(test, feature = "testing"))]
    pub async fn run_lost_work_check_once(self: &Arc<Self>) {
        self.periodic_lost_work_check().await;
    }

    /// `_periodicLostWorkCheck`: selects past-due jobs and re-drives each
    /// via the local performer. Continues the sweep past individual
    /// failures; the next tick is scheduled regardless of outcome (§4.7).
    async fn periodic_lost_work_check(self: &Arc<Self>) {
        let now = self.clock.now();
        let timeout = self.config.queue_process_timeout;
        let store = self.store.clone();

        let jobs = in_transaction(self.txn_factory.as_ref(), move |txn| {
            let store = store.clone();
            Box::pin(async move { store.select_lost_work(txn, now, timeout).await })
        })
        .await;

        let jobs = match jobs {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "lost-work scan failed to query jobs");
                return;
            }
        };

        for job in jobs {
            match self.local_performer.perform_job(job.job_id).await {
                Ok(()) => {}
                Err(err) => {
                    error!(job_id = %job.job_id, error = %err, "lost-work job failed again");
                }
            }
        }
    }
}

fn to_std(d: ChronoDuration) -> std::time::Duration {
    d.to_std().unwrap_or(std::time::Duration::from_secs(1))
}
