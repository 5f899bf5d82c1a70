//! Encodes a `Command` and submits it through the replicated log, turning
//! openraft's not-leader/timeout errors into the manager's own error
//! taxonomy (spec §7).

use prost::Message;
use warren_proto::pb::command::Op;
use warren_proto::pb::Command;
use warren_proto::{Result, WarrenError};
use warren_raft::RaftNode;

pub async fn propose(raft: &RaftNode, op: Op) -> Result<()> {
    let payload = Command { op: Some(op) }.encode_to_vec();

    let ack = raft.propose(payload).await.map_err(|e| {
        if let openraft::error::RaftError::APIError(api_err) = &e {
            if let openraft::error::ClientWriteError::ForwardToLeader(fwd) = api_err {
                return WarrenError::not_leader(fwd.leader_node.as_ref().map(|n| n.addr.clone()));
            }
        }
        WarrenError::Unavailable(e.to_string())
    })?;

    if !ack.ok {
        return Err(WarrenError::internal(
            ack.error.unwrap_or_else(|| "command application failed".to_string()),
        ));
    }
    Ok(())
}
