//! Placement engine (spec §4.7). Runs only while this node is the Raft
//! leader, on a fixed tick; it only ever edits the desired set, never calls
//! the runtime directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};
use warren_proto::pb::{ContainerInstance, DesiredState, NodeRole, NodeStatus, ServiceMode};
use warren_proto::pb::command::Op;
use warren_proto::{new_id, now_timestamp, Result};
use warren_store::Store;
use warren_raft::RaftNode;

use crate::propose::propose;

const TICK_INTERVAL: Duration = Duration::from_secs(5);

pub struct Scheduler {
    store: Arc<Store>,
    raft: Arc<RaftNode>,
}

impl Scheduler {
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
                warn!(error = %e, "scheduler tick failed");
            }
        }
    }

    #[instrument(skip(self))]
    async fn tick(&self) -> Result<()> {
        let nodes = self.store.list_nodes()?;
        let services = self.store.list_services()?;

        let eligible: Vec<_> = nodes
            .iter()
            .filter(|n| {
                matches!(n.role(), NodeRole::Worker | NodeRole::Hybrid)
                    && n.status() == NodeStatus::Ready
            })
            .collect();

        for service in &services {
            let containers = self.store.list_containers_for_service(&service.id)?;
            match service.mode() {
                ServiceMode::Replicated => self.reconcile_replicated(service, &containers, &eligible).await?,
                ServiceMode::Global => self.reconcile_global(service, &containers, &eligible, &nodes).await?,
                ServiceMode::Unspecified => {}
            }
        }

        Ok(())
    }

    async fn reconcile_replicated(
        &self,
        service: &warren_proto::pb::Service,
        containers: &[ContainerInstance],
        eligible: &[&warren_proto::pb::Node],
    ) -> Result<()> {
        let live: Vec<_> = containers
            .iter()
            .filter(|c| {
                c.desired_state() == DesiredState::Running
                    && matches!(
                        c.actual_state(),
                        warren_proto::pb::ActualState::Pending | warren_proto::pb::ActualState::Running
                    )
            })
            .collect();

        let target = service.replicas as usize;

        if live.len() < target {
            if let Some(node_id) = self.select_node_for(service, containers, eligible)? {
                self.create_container(service, &node_id).await?;
                info!(service = %service.name, node = %node_id, "scheduled container");
            }
        } else if live.len() > target {
            let mut excess: Vec<_> = live.iter().collect();
            excess.sort_by(|a, b| {
                b.created_at
                    .as_ref()
                    .map(|t| t.seconds)
                    .cmp(&a.created_at.as_ref().map(|t| t.seconds))
            });
            for container in excess.into_iter().take(live.len() - target) {
                self.shutdown_container(container).await?;
            }
        }

        Ok(())
    }

    /// Chooses the target node for the next replica: a volume's node
    /// affinity wins outright (and the cycle fails rather than rescheduling
    /// elsewhere), otherwise the eligible worker with fewest containers for
    /// this service, ties broken by node id.
    fn select_node_for(
        &self,
        service: &warren_proto::pb::Service,
        containers: &[ContainerInstance],
        eligible: &[&warren_proto::pb::Node],
    ) -> Result<Option<String>> {
        for mount in &service.mounts {
            if let Some(volume) = self.store.get_volume_by_name(&mount.volume_name)? {
                if !volume.node_id.is_empty() {
                    return Ok(eligible
                        .iter()
                        .any(|n| n.id == volume.node_id)
                        .then_some(volume.node_id));
                }
            }
        }

        let mut counts: HashMap<&str, usize> = eligible.iter().map(|n| (n.id.as_str(), 0)).collect();
        for container in containers {
            if let Some(c) = counts.get_mut(container.node_id.as_str()) {
                *c += 1;
            }
        }

        Ok(counts
            .into_iter()
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(id, _)| id.to_string()))
    }

    async fn reconcile_global(
        &self,
        service: &warren_proto::pb::Service,
        containers: &[ContainerInstance],
        eligible: &[&warren_proto::pb::Node],
        all_nodes: &[warren_proto::pb::Node],
    ) -> Result<()> {
        let by_node: HashMap<&str, &ContainerInstance> = containers
            .iter()
            .filter(|c| {
                matches!(
                    c.actual_state(),
                    warren_proto::pb::ActualState::Pending | warren_proto::pb::ActualState::Running
                )
            })
            .map(|c| (c.node_id.as_str(), c))
            .collect();

        for node in eligible {
            if !by_node.contains_key(node.id.as_str()) {
                self.create_container(service, &node.id).await?;
            }
        }

        let node_ids: std::collections::HashSet<_> = all_nodes.iter().map(|n| n.id.as_str()).collect();
        for container in containers {
            if !node_ids.contains(container.node_id.as_str())
                && container.desired_state() == DesiredState::Running
            {
                self.shutdown_container(container).await?;
            }
        }

        Ok(())
    }

    async fn create_container(&self, service: &warren_proto::pb::Service, node_id: &str) -> Result<()> {
        let container = ContainerInstance {
            id: new_id(),
            service_id: service.id.clone(),
            service_name: service.name.clone(),
            node_id: node_id.to_string(),
            runtime_container_id: String::new(),
            desired_state: DesiredState::Running as i32,
            actual_state: warren_proto::pb::ActualState::Pending as i32,
            image: service.image.clone(),
            env: service.env.clone(),
            mounts: service.mounts.clone(),
            secrets: service.secrets.clone(),
            resources: service.resources.clone(),
            health_check: service.health_check.clone(),
            restart_policy: service.restart_policy.clone(),
            healthy: true,
            ip_address: String::new(),
            created_at: Some(now_timestamp()),
            started_at: None,
            finished_at: None,
            error_message: String::new(),
            ports: service.ports.clone(),
        };
        propose(&self.raft, Op::CreateContainer(container)).await
    }

    async fn shutdown_container(&self, container: &ContainerInstance) -> Result<()> {
        let mut updated = container.clone();
        updated.desired_state = DesiredState::Shutdown as i32;
        propose(&self.raft, Op::UpdateContainer(updated)).await
    }
}
