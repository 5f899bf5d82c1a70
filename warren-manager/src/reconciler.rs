//! Failure-detection and replacement engine (spec §4.8). Reactive
//! counterpart to the Scheduler: it only ever turns *observed* failure into
//! container-record state; it never creates replacements itself.

use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};
use warren_proto::pb::command::Op;
use warren_proto::pb::{ActualState, DesiredState, NodeStatus};
use warren_proto::Result;
use warren_raft::RaftNode;
use warren_store::Store;

use crate::propose::propose;

const TICK_INTERVAL: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL_SECONDS: i64 = 5;
const NODE_DOWN_THRESHOLD_SECONDS: i64 = HEARTBEAT_INTERVAL_SECONDS * 3;
const CONTAINER_RETENTION_SECONDS: i64 = 600;

pub struct Reconciler {
    store: Arc<Store>,
    raft: Arc<RaftNode>,
}

impl Reconciler {
    pub fn new(store: Arc<Store>, raft: Arc<RaftNode>) -> Self {
        Self { store, raft }
    }

    pub async fn run_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            if !self.raft.is_leader() {
                continue;
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "reconciler tick failed");
            }
        }
    }

    #[instrument(skip(self))]
    async fn tick(&self) -> Result<()> {
        self.mark_down_nodes().await?;
        self.fail_containers_on_down_nodes().await?;
        self.shutdown_unhealthy_containers().await?;
        self.prune_terminal_containers().await?;
        Ok(())
    }

    /// Deletes `Failed`/`Complete` container records once they're older than
    /// the fixed 10-minute retention window, so a crashed/completed global
    /// or replicated container eventually clears its slot in the store
    /// rather than accumulating forever.
    async fn prune_terminal_containers(&self) -> Result<()> {
        for container in self.store.list_containers()? {
            if !matches!(container.actual_state(), ActualState::Failed | ActualState::Complete) {
                continue;
            }
            let expired = container
                .finished_at
                .as_ref()
                .map(|ts| crate::time::seconds_since(ts) > CONTAINER_RETENTION_SECONDS)
                .unwrap_or(false);
            if expired {
                propose(&self.raft, Op::DeleteContainer(container.id.clone())).await?;
            }
        }
        Ok(())
    }

    async fn mark_down_nodes(&self) -> Result<()> {
        for node in self.store.list_nodes()? {
            if node.status() == NodeStatus::Down {
                continue;
            }
            let stale = node
                .last_heartbeat
                .as_ref()
                .map(|ts| crate::time::seconds_since(ts) > NODE_DOWN_THRESHOLD_SECONDS)
                .unwrap_or(false);

            if stale {
                let mut updated = node.clone();
                updated.status = NodeStatus::Down as i32;
                propose(&self.raft, Op::UpdateNode(updated)).await?;
            }
        }
        Ok(())
    }

    async fn fail_containers_on_down_nodes(&self) -> Result<()> {
        let down_nodes: std::collections::HashSet<_> = self
            .store
            .list_nodes()?
            .into_iter()
            .filter(|n| n.status() == NodeStatus::Down)
            .map(|n| n.id)
            .collect();

        for container in self.store.list_containers()? {
            if down_nodes.contains(&container.node_id)
                && !matches!(container.actual_state(), ActualState::Failed | ActualState::Complete)
            {
                let mut updated = container.clone();
                updated.actual_state = ActualState::Failed as i32;
                updated.error_message = "node is down".to_string();
                propose(&self.raft, Op::UpdateContainer(updated)).await?;
            }
        }
        Ok(())
    }

    /// Containers whose health monitor has flipped `healthy=false` are
    /// marked for shutdown once the owning service's restart policy allows
    /// it; the Scheduler is what actually places the replacement.
    async fn shutdown_unhealthy_containers(&self) -> Result<()> {
        for container in self.store.list_containers()? {
            if !container.healthy && container.desired_state() == DesiredState::Running {
                let mut updated = container.clone();
                updated.desired_state = DesiredState::Shutdown as i32;
                propose(&self.raft, Op::UpdateContainer(updated)).await?;
            }
        }
        Ok(())
    }
}
