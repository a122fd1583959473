//! Persistent entities: [`Job`], [`NodeInfo`], and the work-row contract.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A durable intent to run one unit of work.
///
/// For every `Job` row there exists exactly one corresponding work-type row
/// sharing `job_id` (invariant i in §3); the work row is never created
/// without a `Job` row (invariant ii).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: Uuid,
    pub work_type: String,
    pub priority: i32,
    pub weight: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(work_type: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            work_type: work_type.into(),
            priority: 0,
            weight: 0,
            not_before: None,
            not_after: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn with_not_after(mut self, at: DateTime<Utc>) -> Self {
        self.not_after = Some(at);
        self
    }

    /// Whether `now` has passed this job's `not_before`, i.e. whether the
    /// scheduler's timer for this job should already have fired.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map(|nb| nb <= now).unwrap_or(true)
    }

    /// Whether this job is far enough past `not_before` that it counts as
    /// lost work under the given staleness threshold.
    pub fn is_stale(&self, now: DateTime<Utc>, queue_process_timeout: chrono::Duration) -> bool {
        match self.not_before {
            Some(nb) => nb < now - queue_process_timeout,
            None => true,
        }
    }

    /// Whether `now` has passed this job's `not_after` — the latest
    /// permissible execution timestamp. A performer that loads an expired
    /// job must not run `doWork`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.not_after.map(|na| na < now).unwrap_or(false)
    }
}

/// Liveness advertisement for a controller node. Upserted on service start,
/// refreshed periodically, removed on shutdown; used by peers to discover
/// each other (§4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub hostname: String,
    pub pid: i32,
    pub port: i32,
    pub time: DateTime<Utc>,
}

impl NodeInfo {
    pub fn is_stale(&self, now: DateTime<Utc>, horizon: chrono::Duration) -> bool {
        self.time < now - horizon
    }
}

/// A row in a work-type-specific table, carrying the inputs to `doWork`.
///
/// Implemented once per application work type. `doWork` runs inside the
/// performer's transaction; a domain error is caught by the caller and
/// treated as job consumption (§4.1), not propagated as an infrastructure
/// failure.
#[async_trait::async_trait]
pub trait WorkItem: Send + Sync {
    /// Perform this work item's effect. `txn_handle` is an opaque handle to
    /// the enclosing transaction, passed through unchanged from the loader
    /// so that `doWork` can issue further statements on the same
    /// transaction.
    async fn do_work(&self, txn: &mut dyn crate::txn::Transaction) -> anyhow::Result<()>;
}
