//! gRPC transport for openraft, one `GrpcNetwork` per peer.
//!
//! Grounded on `cbaugus-rust_loadtest`'s `GrpcNetwork`/`GrpcNetworkFactory`:
//! lazy per-peer channel, openraft request/response JSON-serialized into a
//! single `bytes payload` field, `connect_lazy` so a down peer never blocks
//! startup.

use std::time::Duration;

use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{AnyError, BasicNode};
use tonic::transport::{Channel, Endpoint};

use warren_proto::pb::raft_service_client::RaftServiceClient;
use warren_proto::pb::RaftMessage;

use crate::types::{NodeId, TypeConfig};

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

pub struct GrpcNetwork {
    target_addr: String,
    client: Option<RaftServiceClient<Channel>>,
}

impl GrpcNetwork {
    fn get_client(&mut self) -> Result<&mut RaftServiceClient<Channel>, String> {
        if self.client.is_none() {
            let uri = if self.target_addr.starts_with("http") {
                self.target_addr.clone()
            } else {
                format!("http://{}", self.target_addr)
            };
            let channel = Endpoint::from_shared(uri)
                .map_err(|e| e.to_string())?
                .connect_timeout(Duration::from_secs(3))
                .timeout(Duration::from_secs(4))
                .connect_lazy();
            self.client = Some(RaftServiceClient::new(channel));
        }
        Ok(self.client.as_mut().unwrap())
    }
}

impl RaftNetwork<TypeConfig> for GrpcNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload = serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let client = self.get_client().map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let resp = client
            .append_entries(RaftMessage { payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload = serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let client = self.get_client().map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let resp = client
            .vote(RaftMessage { payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload = serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let client = self.get_client().map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let resp = client
            .install_snapshot(RaftMessage { payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates a `GrpcNetwork` per target peer, on demand.
pub struct GrpcNetworkFactory;

impl RaftNetworkFactory<TypeConfig> for GrpcNetworkFactory {
    type Network = GrpcNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        GrpcNetwork {
            target_addr: node.addr.clone(),
            client: None,
        }
    }
}
