//! Container-sync loop and per-container execution pipeline (spec §4.9).
//!
//! Grounded on the teacher's worker state machine
//! (`container/src/node/worker.rs`): one task per container that owns the
//! container's lifecycle end to end, a shared local cache guarded by a
//! single mutex (spec §5 "Local container cache in the worker: protected by
//! a single read/write mutex"), sync and heartbeat driven by independent
//! tickers rather than a shared event loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{error, warn};

use warren_security::SecretsManager;

use warren_proto::pb::cluster_service_client::ClusterServiceClient;
use warren_proto::pb::{
    ActualState, ContainerInstance, DesiredState, GetSecretByNameRequest, HeartbeatRequest,
    ListContainersRequest, NodeStatus, ReportContainerHealthRequest, ResourceSpec,
    UpdateContainerStatusRequest,
};

use crate::dns::DnsConfig;
use crate::health::{probe_once, HealthState};
use crate::ports;
use crate::runtime::{build_binds, ContainerRuntime};
use crate::secrets::SecretMounter;
use crate::volumes::VolumeMounter;

const SYNC_INTERVAL: Duration = Duration::from_secs(3);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const RETENTION: Duration = Duration::from_secs(600);

struct LocalContainer {
    spec: ContainerInstance,
    runtime_container_id: Option<String>,
}

pub struct AgentConfig {
    pub node_id: String,
    pub data_dir: PathBuf,
    pub dns_domain: String,
    pub manager_ip: std::net::IpAddr,
    pub dns_upstreams: Vec<std::net::IpAddr>,
}

pub struct Agent {
    config: AgentConfig,
    client: ClusterServiceClient<Channel>,
    runtime: Arc<ContainerRuntime>,
    secrets: Arc<SecretMounter>,
    volumes: Arc<VolumeMounter>,
    local: Arc<Mutex<HashMap<String, LocalContainer>>>,
    declared_resources: ResourceSpec,
    secrets_manager: SecretsManager,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        client: ClusterServiceClient<Channel>,
        runtime: Arc<ContainerRuntime>,
        declared_resources: ResourceSpec,
        cluster_name: &str,
    ) -> Self {
        let secrets = Arc::new(SecretMounter::new(config.data_dir.join("secrets")));
        let volumes = Arc::new(VolumeMounter::new(config.data_dir.join("volumes")));
        Self {
            config,
            client,
            runtime,
            secrets,
            volumes,
            local: Arc::new(Mutex::new(HashMap::new())),
            declared_resources,
            secrets_manager: SecretsManager::new(cluster_name.as_bytes()),
        }
    }

    /// Runs the heartbeat loop until the process is stopped. Spec §4.9 step
    /// 3's "every ≈5s: report status ... piggy-back a snapshot of every
    /// known local container's actual state".
    pub async fn heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            let containers: Vec<ContainerInstance> = {
                let local = self.local.lock().await;
                local.values().map(|c| c.spec.clone()).collect()
            };
            let request = HeartbeatRequest {
                node_id: self.config.node_id.clone(),
                status: NodeStatus::Ready as i32,
                available: Some(self.declared_resources.clone()),
                containers,
            };
            if let Err(e) = self.client.clone().heartbeat(Request::new(request)).await {
                warn!(error = %e, "heartbeat failed");
            }
        }
    }

    /// Runs the container-sync loop until the process is stopped. Spec
    /// §4.9 step 3's "every ≈3s: call ListContainers(nodeID=self) ... begin
    /// execution / stop it".
    pub async fn sync_loop(self: &Arc<Self>) {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sync_tick().await {
                warn!(error = %e, "container sync tick failed");
            }
        }
    }

    async fn sync_tick(self: &Arc<Self>) -> anyhow::Result<()> {
        let response = self
            .client
            .clone()
            .list_containers(Request::new(ListContainersRequest {
                service_id: String::new(),
                node_id: self.config.node_id.clone(),
            }))
            .await?
            .into_inner();

        let known_ids: Vec<String> = {
            let local = self.local.lock().await;
            local.keys().cloned().collect()
        };
        let returned_ids: std::collections::HashSet<&str> =
            response.containers.iter().map(|c| c.id.as_str()).collect();

        for container in response.containers {
            let is_known = known_ids.iter().any(|id| id == &container.id);
            let desired_running = container.desired_state == DesiredState::Running as i32;
            let desired_shutdown = container.desired_state == DesiredState::Shutdown as i32;

            if !is_known && desired_running {
                {
                    let mut local = self.local.lock().await;
                    local.insert(container.id.clone(), LocalContainer { spec: container.clone(), runtime_container_id: None });
                }
                let this = self.clone();
                tokio::spawn(async move { this.execute(container).await });
            } else if is_known && desired_shutdown {
                let this = self.clone();
                let container_id = container.id.clone();
                tokio::spawn(async move { this.shut_down(&container_id).await });
            }
        }

        // Anything we still hold locally that the manager no longer returns
        // for this node has been reassigned or deleted out from under us;
        // drop it from the cache without tearing down a live container we
        // can no longer confirm ownership of.
        let mut local = self.local.lock().await;
        local.retain(|id, _| returned_ids.contains(id.as_str()));
        Ok(())
    }

    /// Execution pipeline: spec §4.9 steps a-h.
    async fn execute(self: Arc<Self>, mut container: ContainerInstance) {
        let container_id = container.id.clone();

        if let Err(e) = self.runtime.pull_image(&container.image).await {
            self.fail(&mut container, format!("image pull failed: {e}")).await;
            return;
        }

        let mut secret_files = Vec::new();
        let mut secret_mount_dir = None;
        if !container.secrets.is_empty() {
            match self.fetch_secrets(&container.secrets).await {
                Ok(fetched) => {
                    match self.secrets.mount(&container_id, &fetched) {
                        Ok(dir) => {
                            for (name, _) in &fetched {
                                secret_files.push((dir.join(name).to_string_lossy().to_string(), format!("/run/secrets/{name}")));
                            }
                            secret_mount_dir = Some(dir);
                        }
                        Err(e) => {
                            self.fail(&mut container, format!("secret mount failed: {e}")).await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    self.fail(&mut container, format!("secret fetch failed: {e}")).await;
                    return;
                }
            }
        }

        let mut volume_paths = HashMap::new();
        for mount in &container.mounts {
            match self.resolve_volume(&mount.volume_name).await {
                Ok(Some(path)) => {
                    volume_paths.insert(mount.volume_name.clone(), path.to_string_lossy().to_string());
                }
                Ok(None) => {
                    self.fail(&mut container, format!("volume {} not found", mount.volume_name)).await;
                    self.cleanup_secrets(&container_id, secret_mount_dir.is_some());
                    return;
                }
                Err(e) => {
                    self.fail(&mut container, format!("volume materialize failed: {e}")).await;
                    self.cleanup_secrets(&container_id, secret_mount_dir.is_some());
                    return;
                }
            }
        }

        let binds = build_binds(&container.mounts, &volume_paths, &secret_files);
        let dns = DnsConfig {
            manager_ip: self.config.manager_ip,
            upstreams: self.config.dns_upstreams.clone(),
            search_domain: self.config.dns_domain.clone(),
        };

        let runtime_id = match self
            .runtime
            .create_and_start(&container, &binds, vec![dns.manager_ip.to_string()], vec![dns.search_domain.clone()])
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.fail(&mut container, format!("container create/start failed: {e}")).await;
                self.cleanup_secrets(&container_id, secret_mount_dir.is_some());
                return;
            }
        };

        if let Ok(Some(ip)) = self.runtime.inspect_ip(&runtime_id).await {
            container.ip_address = ip;
        }

        if !container.ports.is_empty() {
            let container_ip = container.ip_address.clone();
            if let Err(e) = ports::install(&container, &container_ip).await {
                self.fail(&mut container, format!("port publish failed: {e}")).await;
                self.runtime.stop(&runtime_id, None).await.ok();
                self.cleanup_secrets(&container_id, secret_mount_dir.is_some());
                return;
            }
        }

        container.actual_state = ActualState::Running as i32;
        container.started_at = Some(warren_proto::now_timestamp());
        container.runtime_container_id = runtime_id.clone();
        container.error_message.clear();
        self.update_status(container.clone()).await;

        {
            let mut local = self.local.lock().await;
            if let Some(entry) = local.get_mut(&container_id) {
                entry.spec = container.clone();
                entry.runtime_container_id = Some(runtime_id.clone());
            }
        }

        if let Some(health_check) = container.health_check.clone() {
            if health_check.kind != 0 {
                let this = self.clone();
                let spec = container.clone();
                let rid = runtime_id.clone();
                tokio::spawn(async move { this.health_loop(spec, rid, health_check).await });
            }
        }

        self.exit_poll_loop(container, runtime_id, secret_mount_dir).await;
    }

    async fn exit_poll_loop(&self, mut container: ContainerInstance, runtime_id: String, secret_mount_dir: Option<PathBuf>) {
        loop {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            {
                let local = self.local.lock().await;
                if !local.contains_key(&container.id) {
                    return; // stopped out from under us
                }
            }
            match self.runtime.poll_exit(&runtime_id).await {
                Ok(crate::runtime::ExitOutcome::Running) => continue,
                Ok(crate::runtime::ExitOutcome::Exited { code }) => {
                    container.finished_at = Some(warren_proto::now_timestamp());
                    if code == 0 {
                        container.actual_state = ActualState::Complete as i32;
                    } else {
                        container.actual_state = ActualState::Failed as i32;
                        container.error_message = format!("container exited with code {code}");
                    }
                    self.update_status(container.clone()).await;
                    self.teardown(&container.id, secret_mount_dir.is_some(), !container.ports.is_empty()).await;
                    return;
                }
                Err(e) => {
                    warn!(container_id = %container.id, error = %e, "exit poll failed");
                }
            }
        }
    }

    async fn health_loop(&self, container: ContainerInstance, runtime_id: String, spec: warren_proto::pb::HealthCheckSpec) {
        tokio::time::sleep(Duration::from_secs(spec.start_period_seconds as u64)).await;
        let mut state = HealthState::default();
        let mut ticker = tokio::time::interval(Duration::from_secs(spec.interval_seconds.max(1) as u64));
        loop {
            ticker.tick().await;
            {
                let local = self.local.lock().await;
                if !local.contains_key(&container.id) {
                    return;
                }
            }
            let ok = probe_once(&self.runtime, &runtime_id, &spec).await;
            let healthy = state.record(ok, spec.retries);
            let message = if ok { String::new() } else { format!("probe failed ({})", spec.target) };
            if let Err(e) = self
                .client
                .clone()
                .report_container_health(Request::new(ReportContainerHealthRequest {
                    container_id: container.id.clone(),
                    healthy,
                    message,
                }))
                .await
            {
                warn!(container_id = %container.id, error = %e, "failed to report container health");
            }
        }
    }

    async fn shut_down(&self, container_id: &str) {
        let (runtime_id, has_secrets, has_ports) = {
            let local = self.local.lock().await;
            match local.get(container_id) {
                Some(entry) => (
                    entry.runtime_container_id.clone(),
                    !entry.spec.secrets.is_empty(),
                    !entry.spec.ports.is_empty(),
                ),
                None => return,
            }
        };
        if let Some(runtime_id) = runtime_id {
            if let Err(e) = self.runtime.stop(&runtime_id, None).await {
                error!(container_id, error = %e, "failed to stop container");
            }
        }
        self.teardown(container_id, has_secrets, has_ports).await;

        let mut container = {
            let local = self.local.lock().await;
            local.get(container_id).map(|e| e.spec.clone())
        };
        if let Some(container) = container.as_mut() {
            container.actual_state = ActualState::Complete as i32;
            container.finished_at = Some(warren_proto::now_timestamp());
            self.update_status(container.clone()).await;
        }

        let local = self.local.clone();
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(RETENTION).await;
            local.lock().await.remove(&container_id);
        });
    }

    async fn teardown(&self, container_id: &str, has_secrets: bool, has_ports: bool) {
        if has_secrets {
            self.secrets.unmount(container_id);
        }
        if has_ports {
            ports::remove(container_id).await;
        }
    }

    fn cleanup_secrets(&self, container_id: &str, mounted: bool) {
        if mounted {
            self.secrets.unmount(container_id);
        }
    }

    async fn fetch_secrets(&self, names: &[String]) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let response = self
                .client
                .clone()
                .get_secret_by_name(Request::new(GetSecretByNameRequest { name: name.clone() }))
                .await?
                .into_inner();
            let secret = response.secret.ok_or_else(|| anyhow::anyhow!("secret {name} not found"))?;
            let plaintext = self
                .secrets_manager
                .decrypt(&secret.ciphertext)
                .map_err(|e| anyhow::anyhow!("decrypt secret {name}: {e}"))?;
            out.push((name.clone(), plaintext));
        }
        Ok(out)
    }

    async fn resolve_volume(&self, volume_name: &str) -> anyhow::Result<Option<PathBuf>> {
        let response = self
            .client
            .clone()
            .get_volume(Request::new(warren_proto::pb::GetVolumeRequest { id: String::new(), name: volume_name.to_string() }))
            .await;
        let volume = match response {
            Ok(r) => r.into_inner().volume,
            Err(status) if status.code() == tonic::Code::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match volume {
            Some(volume) => Ok(Some(self.volumes.materialize(&volume)?)),
            None => Ok(None),
        }
    }

    async fn fail(&self, container: &mut ContainerInstance, message: String) {
        warn!(container_id = %container.id, %message, "container execution failed");
        container.actual_state = ActualState::Failed as i32;
        container.error_message = message;
        container.finished_at = Some(warren_proto::now_timestamp());
        self.update_status(container.clone()).await;
    }

    async fn update_status(&self, container: ContainerInstance) {
        {
            let mut local = self.local.lock().await;
            if let Some(entry) = local.get_mut(&container.id) {
                entry.spec = container.clone();
            }
        }
        if let Err(e) = self
            .client
            .clone()
            .update_container_status(Request::new(UpdateContainerStatusRequest { container: Some(container) }))
            .await
        {
            warn!(error = %e, "failed to report container status");
        }
    }
}
