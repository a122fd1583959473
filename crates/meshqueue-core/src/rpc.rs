//! Wire-level realization of the peer/worker RPC contract (§6): a single
//! `Coordination` gRPC service multiplexes `PerformJob` and `ReportLoad`
//! over one connection, with client and server sides sharing the same
//! generated stubs.

use std::str::FromStr;

use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::error::{MeshQueueError, Result};
use crate::peer_fabric::PeerLink;
use crate::performer::Performer;
use crate::worker_pool::WorkerLink;

pub mod proto {
    tonic::include_proto!("meshqueue.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("meshqueue_descriptor");
}

use proto::coordination_client::CoordinationClient;
use proto::coordination_server::{Coordination, CoordinationServer};
use proto::{PerformJobRequest, PerformJobResponse, ReportLoadRequest, ReportLoadResponse};

/// Server side: wraps whatever this node hands incoming `PerformJob`
/// requests to (the node's own `choosePerformer(onlyLocally=true)`, per the
/// one-hop-relay contract in §4.6) and whatever sink consumes `ReportLoad`
/// hints.
pub struct CoordinationService {
    performer: std::sync::Arc<dyn Performer>,
    on_report_load: std::sync::Arc<dyn Fn(i32) + Send + Sync>,
}

impl CoordinationService {
    pub fn new(
        performer: std::sync::Arc<dyn Performer>,
        on_report_load: std::sync::Arc<dyn Fn(i32) + Send + Sync>,
    ) -> CoordinationServer<Self> {
        CoordinationServer::new(Self { performer, on_report_load })
    }
}

#[tonic::async_trait]
impl Coordination for CoordinationService {
    async fn perform_job(
        &self,
        request: Request<PerformJobRequest>,
    ) -> std::result::Result<Response<PerformJobResponse>, Status> {
        let job_id = parse_job_id(&request.get_ref().job_id)?;
        self.performer
            .perform_job(job_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(PerformJobResponse {}))
    }

    async fn report_load(
        &self,
        request: Request<ReportLoadRequest>,
    ) -> std::result::Result<Response<ReportLoadResponse>, Status> {
        (self.on_report_load)(request.get_ref().load);
        Ok(Response::new(ReportLoadResponse {}))
    }
}

fn parse_job_id(raw: &str) -> std::result::Result<Uuid, Status> {
    Uuid::from_str(raw).map_err(|_| Status::invalid_argument("malformed job id"))
}

fn to_status(err: MeshQueueError) -> Status {
    match err {
        MeshQueueError::Conflict(msg) => Status::not_found(msg),
        other => Status::internal(other.to_string()),
    }
}

/// Client-side handle implementing [`WorkerLink`]/[`PeerLink`] over a
/// `tonic` channel. One instance per connected worker or peer.
pub struct CoordinationClientLink {
    client: CoordinationClient<tonic::transport::Channel>,
}

impl CoordinationClientLink {
    pub async fn connect(endpoint: String) -> Result<Self> {
        let client = CoordinationClient::connect(endpoint)
            .await
            .map_err(|e| MeshQueueError::ConnectionLost(e.to_string()))?;
        Ok(Self { client })
    }

    pub async fn report_load(&mut self, load: i32) -> Result<()> {
        self.client
            .report_load(ReportLoadRequest { load })
            .await
            .map_err(|e| MeshQueueError::ConnectionLost(e.to_string()))?;
        Ok(())
    }
}

#[tonic::async_trait]
impl WorkerLink for tokio::sync::Mutex<CoordinationClientLink> {
    async fn perform_job(&self, job_id: Uuid) -> Result<()> {
        let mut guard = self.lock().await;
        guard
            .client
            .perform_job(PerformJobRequest { job_id: job_id.to_string() })
            .await
            .map_err(|e| MeshQueueError::ConnectionLost(e.to_string()))?;
        Ok(())
    }
}

#[tonic::async_trait]
impl PeerLink for tokio::sync::Mutex<CoordinationClientLink> {
    async fn perform_job(&self, job_id: Uuid) -> Result<()> {
        let mut guard = self.lock().await;
        guard
            .client
            .perform_job(PerformJobRequest { job_id: job_id.to_string() })
            .await
            .map_err(|e| MeshQueueError::ConnectionLost(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_job_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_job_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn rejects_malformed_job_id() {
        assert!(parse_job_id("not-a-uuid").is_err());
    }

    #[test]
    fn conflict_maps_to_not_found_status() {
        let status = to_status(MeshQueueError::Conflict("gone".into()));
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn backend_failure_maps_to_internal_status() {
        let status = to_status(MeshQueueError::Backend(anyhow::anyhow!("db down")));
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
