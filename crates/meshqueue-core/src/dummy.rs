//! `DummyWorkItem`/`DummyWorkDone`: a minimal work type exercising every
//! behavior in §8. `doWork` adds `a + b` into a `dummy_work_done` row;
//! `delete_on_load` drives the concurrent-deletion fixture (seed scenario 7).

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{MeshQueueError, Result};
use crate::model::{Job, WorkItem};
use crate::pg::PgTransaction;
use crate::registry::{WorkTypeHandlers, WorkTypeRegistry};
use crate::txn::{SharedTransactionFactory, Transaction};

pub const WORK_TYPE: &str = "dummy_work_item";

/// The row loaded for a `dummy_work_item` job: the two addends `doWork`
/// sums into `dummy_work_done`.
pub struct DummyWorkItemRow {
    pub a: i32,
    pub b: i32,
}

#[async_trait]
impl WorkItem for DummyWorkItemRow {
    async fn do_work(&self, txn: &mut dyn Transaction) -> anyhow::Result<()> {
        if self.a == -1 {
            anyhow::bail!("dummy work item raised: a == -1");
        }
        sqlx::query("INSERT INTO dummy_work_done (work_id, a_plus_b) VALUES ($1, $2)")
            .bind(Uuid::new_v4())
            .bind(self.a + self.b)
            .execute(PgTransaction::conn(txn))
            .await?;
        Ok(())
    }
}

/// Registers the `dummy_work_item` work type's factory and loader.
///
/// `concurrently` supplies the second, independent transaction the loader
/// opens when a job's `delete_on_load` flag is set, simulating a sibling
/// node winning the race to delete the work row before `doWork` runs
/// (Design Notes §9, "'concurrently' transaction hook").
pub fn register(registry: &mut WorkTypeRegistry, concurrently: SharedTransactionFactory) {
    registry.register(
        WORK_TYPE,
        WorkTypeHandlers {
            loader: Arc::new(move |txn, job_id| {
                let concurrently = concurrently.clone();
                Box::pin(async move {
                    let row = sqlx::query(
                        "SELECT a, b, delete_on_load FROM dummy_work_item WHERE job_id = $1",
                    )
                    .bind(job_id)
                    .fetch_optional(PgTransaction::conn(txn))
                    .await
                    .map_err(|e| MeshQueueError::Backend(e.into()))?;

                    let Some(row) = row else {
                        return Ok(None);
                    };

                    let delete_on_load: bool = row.get("delete_on_load");
                    if delete_on_load {
                        let sibling = concurrently.begin().await?;
                        delete_work_row_only(sibling, job_id).await?;
                        return Ok(None);
                    }

                    Ok(Some(Arc::new(DummyWorkItemRow {
                        a: row.get("a"),
                        b: row.get("b"),
                    }) as Arc<dyn WorkItem>))
                })
            }),
            factory: Arc::new(|txn, attrs| {
                Box::pin(async move {
                    let attrs = attrs
                        .as_object()
                        .ok_or_else(|| MeshQueueError::SchemaMismatch {
                            work_type: WORK_TYPE.to_string(),
                            detail: "attrs must be a JSON object".to_string(),
                        })?;

                    const KNOWN: &[&str] = &["a", "b", "delete_on_load", "priority", "weight", "not_before", "not_after"];
                    for key in attrs.keys() {
                        if !KNOWN.contains(&key.as_str()) {
                            return Err(MeshQueueError::SchemaMismatch {
                                work_type: WORK_TYPE.to_string(),
                                detail: format!("unknown column `{key}`"),
                            });
                        }
                    }

                    let a = attrs
                        .get("a")
                        .and_then(|v| v.as_i64())
                        .ok_or_else(|| schema_err("missing or non-integer `a`"))? as i32;
                    let b = attrs
                        .get("b")
                        .and_then(|v| v.as_i64())
                        .ok_or_else(|| schema_err("missing or non-integer `b`"))? as i32;
                    let delete_on_load = attrs
                        .get("delete_on_load")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);

                    let mut job = Job::new(WORK_TYPE);
                    if let Some(p) = attrs.get("priority").and_then(|v| v.as_i64()) {
                        job.priority = p as i32;
                    }
                    if let Some(w) = attrs.get("weight").and_then(|v| v.as_i64()) {
                        job.weight = w as i32;
                    }
                    if let Some(nb) = attrs.get("not_before").and_then(|v| v.as_str()) {
                        job.not_before = Some(
                            chrono::DateTime::parse_from_rfc3339(nb)
                                .map_err(|e| schema_err(&format!("bad not_before: {e}")))?
                                .with_timezone(&chrono::Utc),
                        );
                    }

                    sqlx::query(
                        "INSERT INTO job (job_id, work_type, priority, weight, not_before, not_after) \
                         VALUES ($1, $2, $3, $4, $5, $6)",
                    )
                    .bind(job.job_id)
                    .bind(&job.work_type)
                    .bind(job.priority)
                    .bind(job.weight)
                    .bind(job.not_before)
                    .bind(job.not_after)
                    .execute(PgTransaction::conn(txn))
                    .await
                    .map_err(|e| MeshQueueError::Backend(e.into()))?;

                    sqlx::query(
                        "INSERT INTO dummy_work_item (work_id, job_id, a, b, delete_on_load) \
                         VALUES ($1, $2, $3, $4, $5)",
                    )
                    .bind(Uuid::new_v4())
                    .bind(job.job_id)
                    .bind(a)
                    .bind(b)
                    .bind(delete_on_load)
                    .execute(PgTransaction::conn(txn))
                    .await
                    .map_err(|e| MeshQueueError::Backend(e.into()))?;

                    Ok((job, Arc::new(DummyWorkItemRow { a, b }) as Arc<dyn WorkItem>))
                })
            }),
        },
    );
}

fn schema_err(detail: &str) -> MeshQueueError {
    MeshQueueError::SchemaMismatch {
        work_type: WORK_TYPE.to_string(),
        detail: detail.to_string(),
    }
}

/// Deletes only the `dummy_work_item` row (not the `job` row it references)
/// in its own transaction and commits, simulating a sibling's concurrent
/// delete that wins the race before `doWork` runs. Deliberately does not
/// touch `job` — deleting through the parent would block on the row lock
/// the enclosing performer transaction already holds.
async fn delete_work_row_only(mut sibling: Box<dyn Transaction>, job_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM dummy_work_item WHERE job_id = $1")
        .bind(job_id)
        .execute(PgTransaction::conn(&mut *sibling))
        .await
        .map_err(|e| MeshQueueError::Backend(e.into()))?;
    sibling.commit().await
}
