//! `meshqueue-node`: wires configuration, logging, the database pool, and
//! the peer/worker RPC transports together and runs `Queuer::start_service`
//! until shutdown (§2 item 10).

mod config;
mod discovery;
mod service;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use meshqueue_core::{
    dummy, pg::PgJobRows, pg::PgQueuerStore, pg::PgTransactionFactory, rpc::CoordinationService,
    system_clock, MeshQueueError, Performer, PeerFabric, Queuer, QueuerConfig, Result,
    WorkTypeRegistry, WorkerConnectionPool,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::discovery::PeerDiscovery;
use crate::service::{Service, ServiceHost};

/// Forwards an incoming `PerformJob` to this node's own
/// `choosePerformer(onlyLocally=true)`, matching the one-hop-relay contract
/// every peer/worker RPC endpoint must honor (§4.6).
struct LocalOnlyEntryPoint {
    queuer: Arc<Queuer>,
}

#[async_trait]
impl Performer for LocalOnlyEntryPoint {
    async fn perform_job(&self, job_id: Uuid) -> Result<()> {
        self.queuer.choose_performer(true).await.perform_job(job_id).await
    }
}

/// Serves the `Coordination` RPC on one bound port until cancelled.
struct RpcServer {
    name: &'static str,
    addr: std::net::SocketAddr,
    performer: Arc<dyn Performer>,
}

#[async_trait]
impl Service for RpcServer {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        // ReportLoad requests don't carry sender identity over the wire
        // today, so there is nothing to key a PeerFabric update on yet; log
        // it as a placeholder for when the proto grows a sender field.
        let on_report_load: Arc<dyn Fn(i32) + Send + Sync> = Arc::new(|load: i32| {
            tracing::debug!(load, "peer reported load");
        });
        let service = CoordinationService::new(self.performer.clone(), on_report_load);
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_shutdown(self.addr, shutdown.cancelled())
            .await
            .context("rpc server failed")?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    info!(hostname = %config.hostname, peer_port = config.peer_port, worker_port = config.worker_port, "starting meshqueue-node");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let txn_factory: Arc<dyn meshqueue_core::TransactionFactory> =
        Arc::new(PgTransactionFactory::new(pool));

    let mut registry = WorkTypeRegistry::new();
    dummy::register(&mut registry, txn_factory.clone());
    let registry = Arc::new(registry);

    let job_rows = Arc::new(PgJobRows);
    let store = Arc::new(PgQueuerStore);
    let worker_pool = Arc::new(WorkerConnectionPool::new(meshqueue_core::DEFAULT_MAX_LOAD_PER_WORKER));
    let peer_fabric = Arc::new(PeerFabric::new());

    let queuer_config = QueuerConfig {
        hostname: config.hostname.clone(),
        pid: std::process::id() as i32,
        listen_port: config.peer_port as i32,
        queue_process_timeout: ChronoDuration::seconds(config.queue_process_timeout_secs),
    };

    let queuer = Arc::new(Queuer::new(
        queuer_config,
        system_clock(),
        txn_factory,
        registry,
        job_rows,
        store,
        worker_pool,
        peer_fabric,
    ));

    let entry_point: Arc<dyn Performer> = Arc::new(LocalOnlyEntryPoint { queuer: queuer.clone() });

    let mut host = ServiceHost::new();
    host.spawn(Box::new(RpcServer {
        name: "peer-rpc",
        addr: ([0, 0, 0, 0], config.peer_port).into(),
        performer: entry_point.clone(),
    }));
    // No worker binary ships in this workspace (the master/worker spawning
    // protocol is explicitly left to the implementer), so nothing dials
    // this surface yet; it's live for forward compatibility with sibling
    // worker processes that speak the same Coordination contract.
    host.spawn(Box::new(RpcServer {
        name: "worker-rpc",
        addr: ([0, 0, 0, 0], config.worker_port).into(),
        performer: entry_point,
    }));
    host.spawn(Box::new(PeerDiscovery::new(
        queuer.clone(),
        config.hostname.clone(),
        config.peer_port as i32,
        std::time::Duration::from_secs(config.queue_process_timeout_secs.max(1) as u64),
    )));

    for (host_name, port) in &config.peer_seeds {
        let endpoint = format!("http://{host_name}:{port}");
        match meshqueue_core::rpc::CoordinationClientLink::connect(endpoint).await {
            Ok(client) => {
                let key = (host_name.clone(), *port as i32);
                queuer
                    .peer_fabric()
                    .add_connection(key, Arc::new(tokio::sync::Mutex::new(client)))
                    .await;
                info!(hostname = %host_name, port, "dialled peer seed");
            }
            Err(MeshQueueError::ConnectionLost(detail)) => {
                warn!(hostname = %host_name, port, %detail, "peer seed not reachable at startup");
            }
            Err(err) => warn!(hostname = %host_name, port, error = %err, "unexpected seed dial failure"),
        }
    }

    queuer.start_service().await.context("failed to start queuer")?;

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    host.shutdown().await;
    queuer.stop_service().await.context("failed to deregister node")?;

    Ok(())
}
