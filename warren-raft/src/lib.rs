//! Cluster consensus: an `openraft` instance per manager, its `sled`-backed
//! storage, and the gRPC transport connecting it to peers.
//!
//! The teacher's own `pkg/raft` has no retrievable source in this pack (see
//! DESIGN.md), so this module is grounded on `cbaugus-rust_loadtest`'s
//! `raft.rs`/`grpc.rs` instead, which wires the same `openraft` crate the
//! teacher's dependency graph is built around.

mod network;
mod server;
mod storage;
mod types;

pub use network::{GrpcNetwork, GrpcNetworkFactory};
pub use server::RaftServer;
pub use storage::SledStorage;
pub use types::{node_id_from_str, ApplyAck, Entry, LogPayload, NodeId, RaftInstance, TypeConfig};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use openraft::storage::Adaptor;
use openraft::BasicNode;
use tracing::info;
use warren_store::Fsm;

/// A running Raft node: the `openraft` handle plus the id it registered
/// under. Construct once per manager process via [`start`].
#[derive(Clone)]
pub struct RaftNode {
    pub raft: RaftInstance,
    pub node_id: NodeId,
}

impl RaftNode {
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Submits a command to the replicated log. Only succeeds on the leader;
    /// followers get `openraft::error::RaftError` wrapping `ForwardToLeader`,
    /// which the manager layer turns into `WarrenError::NotLeader`.
    pub async fn propose(
        &self,
        payload: LogPayload,
    ) -> Result<ApplyAck, openraft::error::RaftError<NodeId, openraft::error::ClientWriteError<NodeId, BasicNode>>>
    {
        Ok(self.raft.client_write(payload).await?.data)
    }

    /// Adds `node_id` as a learner, then promotes the full voter set (the
    /// existing voters plus the new one) to replace membership — the
    /// two-step add-learner/change-membership dance openraft requires before
    /// a new member can take part in elections (spec §4.2 "subsequent
    /// managers join via AddVoter issued by the current leader").
    pub async fn add_voter(&self, node_id: NodeId, addr: String) -> anyhow::Result<()> {
        self.raft
            .add_learner(node_id, BasicNode { addr }, true)
            .await?;

        let mut voters: BTreeMap<NodeId, BasicNode> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .nodes()
            .map(|(id, node)| (*id, node.clone()))
            .collect();
        voters.insert(node_id, BasicNode { addr: String::new() });

        self.raft
            .change_membership(voters.into_keys().collect::<std::collections::BTreeSet<_>>(), false)
            .await?;
        Ok(())
    }
}

/// Raft tuning used by every node: heartbeats frequent enough to detect a
/// failed leader within a second, election timeouts tight enough that
/// detection plus a vote round-trip clears well under the 10s failover
/// bound (spec §4.1/§4.2).
fn raft_config(cluster_name: String) -> Arc<openraft::Config> {
    Arc::new(
        openraft::Config {
            cluster_name,
            heartbeat_interval: 250,
            election_timeout_min: 300,
            election_timeout_max: 600,
            ..Default::default()
        }
        .validate()
        .expect("raft config is statically valid"),
    )
}

/// Starts this node's Raft participation.
///
/// `self_addr` must appear in `peers` so the lowest-id member can bootstrap
/// the cluster; a node joining an already-running cluster should pass an
/// empty `peers` and rely on the leader's membership change instead (the
/// manager's join flow drives that, not this function).
pub async fn start(
    cluster_name: String,
    data_dir: &Path,
    self_addr: &str,
    peers: Vec<(NodeId, String)>,
    fsm: Arc<Fsm>,
) -> anyhow::Result<RaftNode> {
    let this_node_id = node_id_from_str(self_addr);

    let storage = SledStorage::open(data_dir, fsm)?;
    let (log_store, state_machine) = Adaptor::new(storage);

    let raft = openraft::Raft::new(
        this_node_id,
        raft_config(cluster_name),
        GrpcNetworkFactory,
        log_store,
        state_machine,
    )
    .await?;

    if !peers.is_empty() {
        let members: BTreeMap<NodeId, BasicNode> = peers
            .iter()
            .map(|(id, addr)| (*id, BasicNode { addr: addr.clone() }))
            .collect();

        let min_id = peers.iter().map(|(id, _)| *id).min().unwrap_or(this_node_id);
        if this_node_id == min_id {
            if let Err(e) = raft.initialize(members).await {
                info!(error = %e, "Raft already initialized, ignoring on restart");
            }
        }
    }

    info!(node_id = this_node_id, peers = peers.len(), "Raft node started");

    Ok(RaftNode {
        raft,
        node_id: this_node_id,
    })
}
