//! Server side of the `RaftService` gRPC transport.
//!
//! Grounded on `cbaugus-rust_loadtest`'s `LoadTestCoordinatorService`
//! Raft-transport handlers: decode the proto `payload` back into the
//! matching openraft request type, forward to the local `Raft` instance,
//! re-encode the response into the same envelope.

use tonic::{Request, Response, Status};

use warren_proto::pb::raft_service_server::RaftService;
use warren_proto::pb::RaftMessage;

use crate::types::{NodeId, RaftInstance, TypeConfig};

#[derive(Clone)]
pub struct RaftServer {
    raft: RaftInstance,
}

impl RaftServer {
    pub fn new(raft: RaftInstance) -> Self {
        Self { raft }
    }
}

fn decode_err(what: &str, e: impl std::fmt::Display) -> Status {
    Status::invalid_argument(format!("failed to decode {what}: {e}"))
}

fn encode_err(what: &str, e: impl std::fmt::Display) -> Status {
    Status::internal(format!("failed to encode {what}: {e}"))
}

#[tonic::async_trait]
impl RaftService for RaftServer {
    async fn append_entries(
        &self,
        request: Request<RaftMessage>,
    ) -> Result<Response<RaftMessage>, Status> {
        let req: openraft::raft::AppendEntriesRequest<TypeConfig> =
            serde_json::from_slice(&request.into_inner().payload)
                .map_err(|e| decode_err("AppendEntriesRequest", e))?;

        let resp = self
            .raft
            .append_entries(req)
            .await
            .map_err(|e| Status::internal(format!("Raft AppendEntries error: {e}")))?;

        let payload = serde_json::to_vec(&resp).map_err(|e| encode_err("AppendEntriesResponse", e))?;
        Ok(Response::new(RaftMessage { payload }))
    }

    async fn vote(&self, request: Request<RaftMessage>) -> Result<Response<RaftMessage>, Status> {
        let req: openraft::raft::VoteRequest<NodeId> = serde_json::from_slice(&request.into_inner().payload)
            .map_err(|e| decode_err("VoteRequest", e))?;

        let resp = self
            .raft
            .vote(req)
            .await
            .map_err(|e| Status::internal(format!("Raft Vote error: {e}")))?;

        let payload = serde_json::to_vec(&resp).map_err(|e| encode_err("VoteResponse", e))?;
        Ok(Response::new(RaftMessage { payload }))
    }

    async fn install_snapshot(
        &self,
        request: Request<RaftMessage>,
    ) -> Result<Response<RaftMessage>, Status> {
        let req: openraft::raft::InstallSnapshotRequest<TypeConfig> =
            serde_json::from_slice(&request.into_inner().payload)
                .map_err(|e| decode_err("InstallSnapshotRequest", e))?;

        let resp = self
            .raft
            .install_snapshot(req)
            .await
            .map_err(|e| Status::internal(format!("Raft InstallSnapshot error: {e}")))?;

        let payload = serde_json::to_vec(&resp).map_err(|e| encode_err("InstallSnapshotResponse", e))?;
        Ok(Response::new(RaftMessage { payload }))
    }
}
