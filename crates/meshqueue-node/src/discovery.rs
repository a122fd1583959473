//! Peer discovery (§4.6, Open Question ii resolved): polls `NODE_INFO` for
//! rows other than this node's own `(hostname, port)` on each tick,
//! dialling newly-seen peers and dropping ones whose advertisement has
//! expired past `2 * queue_process_timeout`.

use std::sync::Arc;

use async_trait::async_trait;
use meshqueue_core::MeshQueueError;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::service::Service;

pub struct PeerDiscovery {
    queuer: Arc<meshqueue_core::queuer::Queuer>,
    self_key: (String, i32),
    interval: std::time::Duration,
}

impl PeerDiscovery {
    pub fn new(
        queuer: Arc<meshqueue_core::queuer::Queuer>,
        self_hostname: String,
        self_port: i32,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            queuer,
            self_key: (self_hostname, self_port),
            interval,
        }
    }

    async fn reconcile_once(&self) {
        let nodes = match self.queuer.active_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(error = %err, "peer discovery failed to list active nodes");
                return;
            }
        };

        let fabric = self.queuer.peer_fabric();
        let horizon = self.queuer.config().queue_process_timeout * 2;
        let now = chrono::Utc::now();

        for node in &nodes {
            let key = (node.hostname.clone(), node.port);
            if key == self.self_key {
                continue;
            }
            if node.is_stale(now, horizon) {
                fabric.remove_connection(&key).await;
                continue;
            }
            if !fabric.contains(&key).await {
                self.dial_if_new(&key).await;
            }
        }
    }

    async fn dial_if_new(&self, key: &(String, i32)) {
        let endpoint = format!("http://{}:{}", key.0, key.1);
        match meshqueue_core::rpc::CoordinationClientLink::connect(endpoint).await {
            Ok(client) => {
                let link = Arc::new(AsyncMutex::new(client));
                self.queuer.peer_fabric().add_connection(key.clone(), link).await;
                debug!(hostname = %key.0, port = key.1, "dialled peer");
            }
            Err(MeshQueueError::ConnectionLost(detail)) => {
                debug!(hostname = %key.0, port = key.1, %detail, "peer not reachable yet");
            }
            Err(err) => warn!(hostname = %key.0, port = key.1, error = %err, "unexpected dial failure"),
        }
    }
}

#[async_trait]
impl Service for PeerDiscovery {
    fn name(&self) -> &str {
        "peer-discovery"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {
                    self.reconcile_once().await;
                }
            }
        }
    }
}
