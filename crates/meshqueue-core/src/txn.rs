//! The transaction helper (§4.2).
//!
//! All database access from the core goes through [`in_transaction`] so
//! that commit/abort handling is uniform and error paths never diverge
//! between call sites.

use async_trait::async_trait;

use crate::error::{MeshQueueError, Result};

/// An opaque handle to a live transaction. Concrete backends (Postgres via
/// `sqlx`, or an in-memory store for tests) implement this to give
/// `in_transaction` something to commit or abort.
///
/// `as_any_mut` lets a backend-specific row operation (e.g. `pg::JobRows`)
/// recover the concrete executor it needs without the generic helper in
/// this module ever depending on `sqlx` — the downcast is the boundary
/// between the backend-agnostic engine and a concrete store.
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn abort(self: Box<Self>) -> Result<()>;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Supplies fresh transactions to the engine. Also the "concurrently" hook
/// from Design Notes §9: a work loader that needs a second, independent
/// transaction against the same store asks the factory for one directly,
/// rather than discovering a method on the transaction instance at runtime.
#[async_trait]
pub trait TransactionFactory: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

pub type SharedTransactionFactory = std::sync::Arc<dyn TransactionFactory>;

/// Acquires a transaction from `factory`, runs `op` against it, and commits
/// on success or aborts on failure, returning a single composite outcome.
///
/// `op` receives the transaction as `&mut dyn Transaction` for the duration
/// of the call; ownership returns to this helper for the commit/abort
/// decision so call sites never have to remember to finalize a transaction
/// themselves.
pub async fn in_transaction<T, F>(factory: &dyn TransactionFactory, op: F) -> Result<T>
where
    for<'a> F: FnOnce(
        &'a mut dyn Transaction,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + Send + 'a>>,
{
    let mut txn = factory.begin().await?;
    let result = op(txn.as_mut()).await;
    match result {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            // Abort failures are swallowed in favor of the original error:
            // the operation's own failure is what the caller needs to see.
            let _ = txn.abort().await;
            Err(err)
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// An in-memory transaction that always succeeds, for tests that don't
    /// need real row-locking semantics.
    pub struct NoopTransaction {
        committed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transaction for NoopTransaction {
        async fn commit(self: Box<Self>) -> Result<()> {
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn abort(self: Box<Self>) -> Result<()> {
            Ok(())
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    #[derive(Default)]
    pub struct InMemoryTransactionFactory {
        pub fail_begin: AtomicBool,
    }

    #[async_trait]
    impl TransactionFactory for InMemoryTransactionFactory {
        async fn begin(&self) -> Result<Box<dyn Transaction>> {
            if self.fail_begin.load(Ordering::SeqCst) {
                return Err(MeshQueueError::Backend(anyhow::anyhow!(
                    "simulated begin failure"
                )));
            }
            Ok(Box::new(NoopTransaction {
                committed: Arc::new(AtomicBool::new(false)),
            }))
        }
    }
}
