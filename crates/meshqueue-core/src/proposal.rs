//! The work proposal (§4.3, Design Notes §9 "Proposal as multi-event
//! handle").
//!
//! `tokio::sync::broadcast` alone doesn't give late subscribers the
//! already-fired value — it only replays messages still in the ring
//! buffer, and a lagged receiver gets an error instead of the outcome.
//! [`Latch`] is a small hand-rolled fire-once cell built on
//! `tokio::sync::watch` plus a recorded terminal value, so that a
//! subscriber arriving after the fact still observes the outcome exactly
//! once, synchronously.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::MeshQueueError;

/// A fire-at-most-once, multi-subscriber cell. Cloning `T` is assumed
/// cheap; outcomes here are unit or a lightweight error.
#[derive(Clone)]
pub struct Latch<T: Clone + Send + Sync + 'static> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for Latch<T> {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }
}

impl<T: Clone + Send + Sync + 'static> Latch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the latch with `value`. A second call is a no-op: once fired,
    /// a latch never changes its recorded outcome.
    pub fn fire(&self, value: T) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                false
            } else {
                *slot = Some(value);
                true
            }
        });
    }

    /// True once `fire` has been called.
    pub fn has_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Awaits the outcome. If the latch has already fired, resolves
    /// immediately with the recorded value; otherwise suspends until
    /// `fire` is called.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow().clone() {
                return value;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without firing; only happens if the
                // Proposal itself was dropped mid-flight.
                panic!("latch sender dropped before firing");
            }
        }
    }
}

/// The outcome recorded by `whenProposed`/`whenCommitted`: either the step
/// completed, or the enclosing transaction aborted.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Ok,
    Aborted,
}

/// The outcome recorded by `whenExecuted`.
#[derive(Debug, Clone)]
pub enum ExecutedOutcome {
    /// The performer's transaction committed the job's deletion.
    Ok,
    /// The enclosing enqueue transaction aborted before this job could ever
    /// be performed.
    EnqueueAborted,
}

impl ExecutedOutcome {
    pub fn into_result(self) -> Result<(), MeshQueueError> {
        match self {
            ExecutedOutcome::Ok => Ok(()),
            ExecutedOutcome::EnqueueAborted => Err(MeshQueueError::EnqueueAborted),
        }
    }
}

/// The handle returned by `enqueueWork`. Holds the three latches described
/// in §4.3 plus the job id they refer to.
#[derive(Clone)]
pub struct Proposal {
    pub job_id: Uuid,
    when_proposed: Latch<StageOutcome>,
    when_committed: Latch<StageOutcome>,
    when_executed: Latch<ExecutedOutcome>,
}

impl Proposal {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            when_proposed: Latch::new(),
            when_committed: Latch::new(),
            when_executed: Latch::new(),
        }
    }

    pub fn fire_proposed(&self, outcome: StageOutcome) {
        self.when_proposed.fire(outcome);
    }

    pub fn fire_committed(&self, outcome: StageOutcome) {
        self.when_committed.fire(outcome.clone());
        if let StageOutcome::Aborted = outcome {
            self.when_executed.fire(ExecutedOutcome::EnqueueAborted);
        }
    }

    pub fn fire_executed(&self, outcome: ExecutedOutcome) {
        self.when_executed.fire(outcome);
    }

    pub async fn when_proposed(&self) -> StageOutcome {
        self.when_proposed.wait().await
    }

    pub async fn when_committed(&self) -> StageOutcome {
        self.when_committed.wait().await
    }

    pub async fn when_executed(&self) -> ExecutedOutcome {
        self.when_executed.wait().await
    }

    /// True once `whenExecuted` has fired. Lets a caller check without
    /// suspending, e.g. to assert a scheduled execution hasn't run yet.
    pub fn is_executed(&self) -> bool {
        self.when_executed.has_fired()
    }
}

/// A callback invoked with every new `Proposal` a queuer creates, used by
/// `LocalQueuer`/`NonPerformingQueuer` test fixtures (§4.8).
pub type ProposalCallback = Arc<dyn Fn(&Proposal) + Send + Sync>;
