//! Error taxonomy for the coordination engine.
//!
//! # Error Boundary Rule
//!
//! Two failure classes cross every layer of this crate: a *conflict*, where
//! the row a caller expected to act on is simply gone (lost a race to
//! another node, or was already consumed), and a *backend* failure, where
//! the database or transport itself misbehaved. The two are never folded
//! together: a conflict is routine and silent; a backend failure is logged
//! and, for job execution, leaves the row in place for the lost-work scan
//! to retry.

use thiserror::Error;

/// Errors raised by the coordination engine.
#[derive(Debug, Error)]
pub enum MeshQueueError {
    /// The row the caller expected to observe is gone: concurrently deleted,
    /// already claimed by another node, or never existed. Callers treat this
    /// as a no-op success per the concurrent-deletion contract in §4.4.
    #[error("row gone: {0}")]
    Conflict(String),

    /// `doWork` raised a domain error. The job is considered consumed; its
    /// rows are still deleted. Carries the domain error for logging.
    #[error("work failed: {0}")]
    WorkFailed(#[source] anyhow::Error),

    /// The transaction could not be acquired, or aborted for reasons other
    /// than a row conflict (connection loss, serialization failure, etc).
    /// The job row is left untouched for the lost-work scan.
    #[error("backend failure: {0}")]
    Backend(#[source] anyhow::Error),

    /// `enqueueWork` was called with attributes that don't match the
    /// work-type's registered columns. Surfaced synchronously to the caller.
    #[error("schema mismatch for work type {work_type}: {detail}")]
    SchemaMismatch { work_type: String, detail: String },

    /// A work type name was used that has no registered handlers.
    #[error("unknown work type: {0}")]
    UnknownWorkType(String),

    /// A timer was about to be scheduled with a negative delay. Programmer
    /// error; fails fast rather than silently clamping.
    #[error("negative timer delay: {0:?}")]
    NegativeDelay(std::time::Duration),

    /// The enclosing transaction for an enqueue aborted before commit.
    /// `Proposal::when_executed` resolves to this.
    #[error("enqueue aborted")]
    EnqueueAborted,

    /// `startService` was called twice on the same queuer instance.
    #[error("service already started")]
    AlreadyStarted,

    /// A peer or worker RPC failed; the connection is removed and the job
    /// remains in the database for the next scan.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A performer loaded a job past its `not_after` deadline. The rows are
    /// deleted without running `doWork`; the job is consumed, not retried.
    #[error("job {0} expired before it could run")]
    Expired(uuid::Uuid),
}

impl MeshQueueError {
    /// True if this error represents a routine, silent "somebody else got
    /// there first" outcome rather than a real failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, MeshQueueError::Conflict(_))
    }

    /// True if the job row should remain in the database for the lost-work
    /// scan to retry (infrastructure failure), as opposed to being
    /// considered consumed (domain failure or conflict).
    pub fn leaves_job_for_retry(&self) -> bool {
        matches!(self, MeshQueueError::Backend(_) | MeshQueueError::ConnectionLost(_))
    }
}

pub type Result<T> = std::result::Result<T, MeshQueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_recognized() {
        let err = MeshQueueError::Conflict("job 1 gone".into());
        assert!(err.is_conflict());
        assert!(!err.leaves_job_for_retry());
    }

    #[test]
    fn backend_failure_leaves_job_for_retry() {
        let err = MeshQueueError::Backend(anyhow::anyhow!("connection reset"));
        assert!(!err.is_conflict());
        assert!(err.leaves_job_for_retry());
    }

    #[test]
    fn work_failed_does_not_leave_job_for_retry() {
        let err = MeshQueueError::WorkFailed(anyhow::anyhow!("domain error"));
        assert!(!err.leaves_job_for_retry());
    }

    #[test]
    fn expired_does_not_leave_job_for_retry() {
        let err = MeshQueueError::Expired(uuid::Uuid::nil());
        assert!(!err.is_conflict());
        assert!(!err.leaves_job_for_retry());
    }
}
