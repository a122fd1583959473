//! Integration tests against a real Postgres container, covering the seed
//! scenarios (§8) that depend on actual row-locking semantics rather than
//! the in-memory transaction fixture. Shares one container across the
//! module via a `OnceCell`, migrating a fresh schema per test.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use meshqueue_core::pg::{PgJobRows, PgQueuerStore, PgTransactionFactory};
use meshqueue_core::{
    dummy, in_transaction, system_clock, PeerFabric, Queuer, QueuerConfig, WorkTypeRegistry,
    WorkerConnectionPool,
};
use serde_json::json;
use sqlx::PgPool;
use testcontainers::core::WaitFor;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::sync::OnceCell;

struct SharedInfra {
    db_url: String,
    _postgres: ContainerAsync<GenericImage>,
}

static SHARED_INFRA: OnceCell<SharedInfra> = OnceCell::const_new();

async fn shared_infra() -> &'static SharedInfra {
    SHARED_INFRA
        .get_or_init(|| async {
            let postgres = GenericImage::new("postgres", "16")
                .with_wait_for(WaitFor::message_on_stderr(
                    "database system is ready to accept connections",
                ))
                .with_env_var("POSTGRES_PASSWORD", "postgres")
                .with_env_var("POSTGRES_USER", "postgres")
                .with_env_var("POSTGRES_DB", "postgres")
                .start()
                .await
                .expect("failed to start postgres container");

            let host = postgres.get_host().await.expect("container host");
            let port = postgres
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");
            let db_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

            SharedInfra {
                db_url,
                _postgres: postgres,
            }
        })
        .await
}

/// Fresh pool against the shared container, migrated once per test so each
/// test sees an empty schema.
async fn fresh_pool() -> PgPool {
    let infra = shared_infra().await;
    let pool = PgPool::connect(&infra.db_url)
        .await
        .expect("failed to connect to test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");
    pool
}

type SharedTxnFactory = Arc<dyn meshqueue_core::TransactionFactory>;

fn make_queuer(pool: PgPool) -> (Arc<Queuer>, SharedTxnFactory) {
    let txn_factory: SharedTxnFactory = Arc::new(PgTransactionFactory::new(pool));

    let mut registry = WorkTypeRegistry::new();
    dummy::register(&mut registry, txn_factory.clone());

    let queuer = Arc::new(Queuer::new(
        QueuerConfig {
            hostname: "test-node".into(),
            pid: std::process::id() as i32,
            listen_port: 4000,
            queue_process_timeout: ChronoDuration::seconds(30),
        },
        system_clock(),
        txn_factory.clone(),
        Arc::new(registry),
        Arc::new(PgJobRows),
        Arc::new(PgQueuerStore),
        Arc::new(WorkerConnectionPool::new(8)),
        Arc::new(PeerFabric::new()),
    ));

    (queuer, txn_factory)
}

/// Seed scenario 1: enqueue a due `dummy_work_item`, let the queuer's timer
/// pick it up, and confirm `doWork` ran exactly once.
#[tokio::test]
async fn happy_path_runs_once_and_records_result() {
    let pool = fresh_pool().await;
    let (queuer, txn_factory) = make_queuer(pool.clone());

    let proposal = in_transaction(txn_factory.as_ref(), |txn| {
        let queuer = queuer.clone();
        Box::pin(async move {
            queuer
                .enqueue_work(txn, dummy::WORK_TYPE, json!({"a": 3, "b": 4}))
                .await
        })
    })
    .await
    .unwrap();

    queuer.notify_enclosing_transaction(&proposal, true);
    proposal.when_executed().await;

    let row: (i32,) = sqlx::query_as("SELECT a_plus_b FROM dummy_work_done")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.0, 7);

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM job")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

/// Seed scenario 5: a domain failure in `doWork` still consumes the job row
/// (no retry loop), and a second, independent job enqueued alongside it is
/// unaffected.
#[tokio::test]
async fn domain_failure_still_consumes_job_row() {
    let pool = fresh_pool().await;
    let (queuer, txn_factory) = make_queuer(pool.clone());

    let failing = in_transaction(txn_factory.as_ref(), |txn| {
        let queuer = queuer.clone();
        Box::pin(async move {
            queuer
                .enqueue_work(txn, dummy::WORK_TYPE, json!({"a": -1, "b": 1}))
                .await
        })
    })
    .await
    .unwrap();
    queuer.notify_enclosing_transaction(&failing, true);

    let healthy = in_transaction(txn_factory.as_ref(), |txn| {
        let queuer = queuer.clone();
        Box::pin(async move {
            queuer
                .enqueue_work(txn, dummy::WORK_TYPE, json!({"a": 10, "b": 20}))
                .await
        })
    })
    .await
    .unwrap();
    queuer.notify_enclosing_transaction(&healthy, true);

    failing.when_executed().await;
    healthy.when_executed().await;

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM job")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0);

    let done: i64 = sqlx::query_scalar("SELECT count(*) FROM dummy_work_done")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(done, 1);
}

/// Seed scenario 7: a sibling transaction deletes the work row (but not the
/// job row) before the loader runs; the job is still cleaned up without
/// deadlocking against the performer's own `SELECT ... FOR UPDATE`.
#[tokio::test]
async fn concurrent_delete_of_work_row_is_cleaned_up_without_deadlock() {
    let pool = fresh_pool().await;
    let (queuer, txn_factory) = make_queuer(pool.clone());

    let proposal = in_transaction(txn_factory.as_ref(), |txn| {
        let queuer = queuer.clone();
        Box::pin(async move {
            queuer
                .enqueue_work(
                    txn,
                    dummy::WORK_TYPE,
                    json!({"a": 1, "b": 1, "delete_on_load": true}),
                )
                .await
        })
    })
    .await
    .unwrap();
    queuer.notify_enclosing_transaction(&proposal, true);

    tokio::time::timeout(std::time::Duration::from_secs(5), proposal.when_executed())
        .await
        .expect("perform_job deadlocked or never completed");

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM job")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0);

    let done: i64 = sqlx::query_scalar("SELECT count(*) FROM dummy_work_done")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(done, 0);
}

/// Seed scenario 2/3: a future `not_before` delays execution; the lost-work
/// scan is not needed when the timer itself is still live.
#[tokio::test]
async fn future_not_before_delays_execution() {
    let pool = fresh_pool().await;
    let (queuer, txn_factory) = make_queuer(pool.clone());

    let not_before = Utc::now() + ChronoDuration::milliseconds(300);
    let proposal = in_transaction(txn_factory.as_ref(), |txn| {
        let queuer = queuer.clone();
        Box::pin(async move {
            queuer
                .enqueue_work(
                    txn,
                    dummy::WORK_TYPE,
                    json!({"a": 2, "b": 5, "not_before": not_before.to_rfc3339()}),
                )
                .await
        })
    })
    .await
    .unwrap();
    queuer.notify_enclosing_transaction(&proposal, true);

    let still_pending: i64 = sqlx::query_scalar("SELECT count(*) FROM job")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(still_pending, 1);

    proposal.when_executed().await;

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM job")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

/// Directly inserts a `job` + `dummy_work_item` row, bypassing `enqueue_work`
/// so no timer gets armed for it — only the lost-work scan can find it.
async fn insert_raw_job(pool: &PgPool, not_before: chrono::DateTime<Utc>, a: i32, b: i32) -> uuid::Uuid {
    let job_id = uuid::Uuid::new_v4();
    sqlx::query(
        "INSERT INTO job (job_id, work_type, priority, weight, not_before) VALUES ($1, $2, 0, 0, $3)",
    )
    .bind(job_id)
    .bind(dummy::WORK_TYPE)
    .bind(not_before)
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO dummy_work_item (work_id, job_id, a, b, delete_on_load) VALUES ($1, $2, $3, $4, false)",
    )
    .bind(uuid::Uuid::new_v4())
    .bind(job_id)
    .bind(a)
    .bind(b)
    .execute(pool)
    .await
    .unwrap();
    job_id
}

/// Seed scenario 4: of three jobs inserted directly (one fresh, one well
/// past `queue_process_timeout`, one far in the future), only the stale one
/// is picked up by a single scan tick.
#[tokio::test]
async fn lost_work_scan_picks_up_only_the_stale_job() {
    let pool = fresh_pool().await;
    let (queuer, _txn_factory) = make_queuer(pool.clone());

    let now = Utc::now();
    let timeout = ChronoDuration::seconds(30);
    insert_raw_job(&pool, now, 1, 0).await;
    insert_raw_job(&pool, now - timeout - ChronoDuration::seconds(20), 2, 0).await;
    insert_raw_job(&pool, now + ChronoDuration::days(1000), 9, 0).await;

    queuer.run_lost_work_check_once().await;

    let done: Vec<i32> =
        sqlx::query_scalar("SELECT a_plus_b FROM dummy_work_done ORDER BY a_plus_b")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(done, vec![2]);

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM job")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 2);
}

/// Seed scenario 5: of three past-due jobs where the middle one's `doWork`
/// raises, the scan still runs the third and the done-table ends up with
/// exactly the two successful sums.
#[tokio::test]
async fn lost_work_scan_continues_past_a_failing_job() {
    let pool = fresh_pool().await;
    let (queuer, _txn_factory) = make_queuer(pool.clone());

    let past_due = Utc::now() - ChronoDuration::seconds(60);
    insert_raw_job(&pool, past_due, 1, 0).await;
    insert_raw_job(&pool, past_due, -1, 1).await;
    insert_raw_job(&pool, past_due, 2, 0).await;

    queuer.run_lost_work_check_once().await;

    let mut done: Vec<i32> = sqlx::query_scalar("SELECT a_plus_b FROM dummy_work_done")
        .fetch_all(&pool)
        .await
        .unwrap();
    done.sort();
    assert_eq!(done, vec![1, 2]);

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM job")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}
