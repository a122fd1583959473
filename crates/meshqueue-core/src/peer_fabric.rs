//! Peer fabric (§4.6).
//!
//! The set of connections to other controllers. Relays `PerformJob(jobID)`
//! to the peer with the lowest reported load; the receiving peer dispatches
//! to its own `choosePerformer(onlyLocally=true)` so the relay is bounded
//! to exactly one hop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{MeshQueueError, Result};
use crate::performer::Performer;

/// Wire-level dialogue with one peer controller: `PerformJob` (request with
/// a reply) and `ReportLoad` (one-way, periodic). `rpc::PeerClient` is the
/// `tonic` realization.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn perform_job(&self, job_id: Uuid) -> Result<()>;
}

struct PeerConnection {
    link: Arc<dyn PeerLink>,
    load_estimate: AtomicI64,
}

/// Identifies a peer by its advertised `(hostname, port)` coordinates, the
/// same key `NODE_INFO` uses (§6).
pub type PeerKey = (String, i32);

/// The set of live peer connections for this node. Also implements the
/// performer capability by relaying to the peer with the minimum reported
/// load estimate.
#[derive(Default)]
pub struct PeerFabric {
    connections: RwLock<HashMap<PeerKey, Arc<PeerConnection>>>,
    insertion_order: RwLock<Vec<PeerKey>>,
}

impl PeerFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a dialled or inbound peer connection.
    pub async fn add_connection(&self, key: PeerKey, link: Arc<dyn PeerLink>) {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&key) {
            return;
        }
        connections.insert(
            key.clone(),
            Arc::new(PeerConnection {
                link,
                load_estimate: AtomicI64::new(0),
            }),
        );
        self.insertion_order.write().await.push(key);
    }

    /// A peer's RPC failed; the connection is removed. `choosePerformer`
    /// re-decides on its next call; the in-flight job remains in the
    /// database for the next lost-work scan (§7).
    pub async fn remove_connection(&self, key: &PeerKey) {
        self.connections.write().await.remove(key);
        self.insertion_order.write().await.retain(|k| k != key);
    }

    /// Records the latest load estimate reported by a peer via
    /// `ReportLoad`. Unreliable and periodic; a missed update just means
    /// the cached estimate goes briefly stale.
    pub async fn report_load(&self, key: &PeerKey, load: i32) {
        if let Some(conn) = self.connections.read().await.get(key) {
            conn.load_estimate.store(load as i64, Ordering::SeqCst);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn contains(&self, key: &PeerKey) -> bool {
        self.connections.read().await.contains_key(key)
    }

    /// Returns the peer with the minimum `currentLoadEstimate`, ties broken
    /// by insertion order (seed scenario 6).
    pub async fn least_loaded(&self) -> Option<Arc<dyn PeerLink>> {
        let order = self.insertion_order.read().await;
        let connections = self.connections.read().await;

        let mut best: Option<(&PeerKey, i64)> = None;
        for key in order.iter() {
            if let Some(conn) = connections.get(key) {
                let load = conn.load_estimate.load(Ordering::SeqCst);
                match best {
                    Some((_, best_load)) if best_load <= load => {}
                    _ => best = Some((key, load)),
                }
            }
        }

        best.and_then(|(key, _)| connections.get(key).map(|c| c.link.clone()))
    }
}

#[async_trait]
impl Performer for PeerFabric {
    async fn perform_job(&self, job_id: Uuid) -> Result<()> {
        let peer = self
            .least_loaded()
            .await
            .ok_or_else(|| MeshQueueError::ConnectionLost("no peers connected".into()))?;
        peer.perform_job(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubPeer {
        name: &'static str,
        calls: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl PeerLink for StubPeer {
        async fn perform_job(&self, _job_id: Uuid) -> Result<()> {
            self.calls.lock().unwrap().push(self.name);
            Ok(())
        }
    }

    fn key(host: &str) -> PeerKey {
        (host.to_string(), 5000)
    }

    #[tokio::test]
    async fn chooses_least_loaded_peer() {
        let fabric = PeerFabric::new();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        fabric
            .add_connection(key("a"), Arc::new(StubPeer { name: "a", calls: calls.clone() }))
            .await;
        fabric
            .add_connection(key("b"), Arc::new(StubPeer { name: "b", calls: calls.clone() }))
            .await;
        fabric
            .add_connection(key("c"), Arc::new(StubPeer { name: "c", calls: calls.clone() }))
            .await;

        fabric.report_load(&key("a"), 1).await;
        fabric.report_load(&key("b"), 0).await;
        fabric.report_load(&key("c"), 2).await;

        fabric.perform_job(Uuid::new_v4()).await.unwrap();
        assert_eq!(calls.lock().unwrap().as_slice(), &["b"]);

        fabric.report_load(&key("b"), 2).await;
        fabric.perform_job(Uuid::new_v4()).await.unwrap();
        assert_eq!(calls.lock().unwrap().as_slice(), &["b", "a"]);
    }

    #[tokio::test]
    async fn no_peers_means_no_performer() {
        let fabric = PeerFabric::new();
        let result = fabric.perform_job(Uuid::new_v4()).await;
        assert!(matches!(result, Err(MeshQueueError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn remove_connection_drops_from_selection() {
        let fabric = PeerFabric::new();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        fabric
            .add_connection(key("a"), Arc::new(StubPeer { name: "a", calls }))
            .await;
        assert_eq!(fabric.connection_count().await, 1);
        fabric.remove_connection(&key("a")).await;
        assert_eq!(fabric.connection_count().await, 0);
    }
}
