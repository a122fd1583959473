//! The work item registry (§4.1).
//!
//! Each application work type is a name registered with a small record of
//! three function pointers, rather than a subclass hierarchy: a loader, a
//! factory, and (via the loaded row's [`WorkItem`] impl) a doer.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{MeshQueueError, Result};
use crate::model::{Job, WorkItem};
use crate::txn::Transaction;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// `(txn, jobID) -> workRow`, locking the row against concurrent loaders.
/// Returns `Ok(None)` when the row is gone — the concurrent-deletion case
/// from §4.4 and seed scenario 7.
pub type LoaderFn = Arc<
    dyn for<'a> Fn(&'a mut dyn Transaction, Uuid) -> BoxFuture<'a, Result<Option<Arc<dyn WorkItem>>>>
        + Send
        + Sync,
>;

/// `(txn, attrs) -> (Job, workRow)`, inserting both rows in the caller's
/// transaction. Rejects unknown attribute keys with `SchemaMismatch`.
pub type FactoryFn = Arc<
    dyn for<'a> Fn(
            &'a mut dyn Transaction,
            Value,
        ) -> BoxFuture<'a, Result<(Job, Arc<dyn WorkItem>)>>
        + Send
        + Sync,
>;

/// The three function pointers registered per work type.
#[derive(Clone)]
pub struct WorkTypeHandlers {
    pub loader: LoaderFn,
    pub factory: FactoryFn,
}

/// Maps `WORK_TYPE` strings bit-for-bit to their handlers. The mapping
/// itself is the compatibility contract (§6): the string must match the
/// backing table name exactly.
#[derive(Default, Clone)]
pub struct WorkTypeRegistry {
    handlers: HashMap<String, WorkTypeHandlers>,
}

impl WorkTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the loader/factory pair for `work_type`. Panics on a
    /// duplicate registration: a work type colliding with an existing one
    /// is a misconfiguration, not a runtime condition to recover from.
    pub fn register(&mut self, work_type: impl Into<String>, handlers: WorkTypeHandlers) {
        let work_type = work_type.into();
        if self.handlers.contains_key(&work_type) {
            panic!("work type already registered: {work_type}");
        }
        self.handlers.insert(work_type, handlers);
    }

    pub fn get(&self, work_type: &str) -> Result<&WorkTypeHandlers> {
        self.handlers
            .get(work_type)
            .ok_or_else(|| MeshQueueError::UnknownWorkType(work_type.to_string()))
    }

    pub fn has(&self, work_type: &str) -> bool {
        self.handlers.contains_key(work_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Looks up `work_type` and runs its factory against `txn`, producing the
/// inserted `Job` row. Shared by every enqueue surface (`Queuer`,
/// `LocalQueuer`, `NonPerformingQueuer`) so the schema-mismatch and
/// unknown-work-type error paths never diverge between them.
pub async fn insert_via_factory(
    registry: &WorkTypeRegistry,
    txn: &mut dyn Transaction,
    work_type: &str,
    attrs: Value,
) -> Result<Job> {
    let handlers = registry.get(work_type)?;
    let (job, _work_row) = (handlers.factory)(txn, attrs).await?;
    Ok(job)
}

impl std::fmt::Debug for WorkTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkTypeRegistry")
            .field("registered_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handlers() -> WorkTypeHandlers {
        WorkTypeHandlers {
            loader: Arc::new(|_txn, _job_id| Box::pin(async { Ok(None) })),
            factory: Arc::new(|_txn, _attrs| {
                Box::pin(async { Err(MeshQueueError::UnknownWorkType("unused".into())) })
            }),
        }
    }

    #[test]
    fn registers_and_looks_up() {
        let mut registry = WorkTypeRegistry::new();
        registry.register("dummy_work_item", noop_handlers());
        assert!(registry.has("dummy_work_item"));
        assert!(registry.get("dummy_work_item").is_ok());
    }

    #[test]
    fn unknown_work_type_errors() {
        let registry = WorkTypeRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(MeshQueueError::UnknownWorkType(_))
        ));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let mut registry = WorkTypeRegistry::new();
        registry.register("dummy_work_item", noop_handlers());
        registry.register("dummy_work_item", noop_handlers());
    }
}
