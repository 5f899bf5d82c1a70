//! Container runtime facade backed by `bollard` (spec §4.9's execution
//! pipeline step a/e/f/h). Grounded on the teacher's `ContainerRuntime`
//! (`container/src/runtime/runtime.rs`): one long-lived handle per process,
//! pull-then-create-then-start, poll for exit rather than block on it.

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use tracing::{info, warn};

use warren_proto::pb::{ContainerInstance, MountSpec, PortMode, PortProtocol};

const DEFAULT_STOP_GRACE_SECONDS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Running,
    Exited { code: i64 },
}

/// Bind mounts and tmpfs secret mounts resolved by the caller before
/// `create_and_start` is invoked; the runtime facade only knows how to wire
/// them into the container spec, not how to materialize them.
pub struct ResolvedMounts {
    pub binds: Vec<String>, // "host_path:container_path[:ro]"
}

pub struct ContainerRuntime {
    docker: Docker,
}

impl ContainerRuntime {
    /// Connects to the local Docker-compatible daemon socket. `socket_path`
    /// overrides the default `/var/run/docker.sock` when the worker config
    /// names one (spec §6 worker config's `runtimeSocket?`).
    pub fn connect(socket_path: Option<&str>) -> anyhow::Result<Self> {
        let docker = match socket_path {
            Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)?,
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self { docker })
    }

    /// Pulls `image` if not already present locally. Spec §4.9 step (a).
    pub async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
        let options = Some(CreateImageOptions { from_image: image, ..Default::default() });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            if let Err(e) = progress {
                return Err(anyhow::anyhow!("image pull failed for {image}: {e}"));
            }
        }
        Ok(())
    }

    /// Creates and starts a container for `spec`, wiring environment, mounts,
    /// DNS configuration, resource limits and host-mode port bindings (spec
    /// §4.9 step e/f). Returns the runtime-assigned container id.
    pub async fn create_and_start(
        &self,
        spec: &ContainerInstance,
        mounts: &ResolvedMounts,
        dns_servers: Vec<String>,
        dns_search: Vec<String>,
    ) -> anyhow::Result<String> {
        let name = format!("warren-{}", spec.id);
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for port in &spec.ports {
            if port.mode != PortMode::Host as i32 || port.host_port == 0 {
                continue;
            }
            let proto = if port.protocol == PortProtocol::Udp as i32 { "udp" } else { "tcp" };
            let key = format!("{}/{proto}", port.container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.host_port.to_string()),
                }]),
            );
        }

        let cpu_quota = spec.resources.as_ref().map(|r| (r.cpu_cores_milli as i64) * 100);
        let memory = spec.resources.as_ref().map(|r| r.memory_bytes as i64);

        let host_config = HostConfig {
            binds: Some(mounts.binds.clone()),
            port_bindings: if port_bindings.is_empty() { None } else { Some(port_bindings) },
            cpu_quota,
            cpu_period: cpu_quota.map(|_| 100_000),
            memory,
            dns: if dns_servers.is_empty() { None } else { Some(dns_servers) },
            dns_search: if dns_search.is_empty() { None } else { Some(dns_search) },
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: if exposed_ports.is_empty() { None } else { Some(exposed_ports) },
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(CreateContainerOptions { name: name.clone(), platform: None }), config)
            .await?;

        self.docker.start_container(&created.id, None::<StartContainerOptions<String>>).await?;
        info!(container_id = %spec.id, runtime_id = %created.id, "container started");
        Ok(created.id)
    }

    /// Spec §4.9's shutdown contract: SIGTERM, grace period, SIGKILL on
    /// timeout, then remove the runtime container record.
    pub async fn stop(&self, runtime_container_id: &str, grace_seconds: Option<i64>) -> anyhow::Result<()> {
        let t = grace_seconds.unwrap_or(DEFAULT_STOP_GRACE_SECONDS);
        if let Err(e) = self
            .docker
            .stop_container(runtime_container_id, Some(StopContainerOptions { t: t as i64 }))
            .await
        {
            warn!(runtime_container_id, error = %e, "stop_container failed, attempting removal anyway");
        }
        self.docker
            .remove_container(
                runtime_container_id,
                Some(RemoveContainerOptions { force: true, ..Default::default() }),
            )
            .await
            .ok();
        Ok(())
    }

    /// Reads back the runtime-assigned container IP so it can be recorded
    /// on the container record for DNS answers (spec §4.12: "returns the
    /// real container IP if recorded").
    pub async fn inspect_ip(&self, runtime_container_id: &str) -> anyhow::Result<Option<String>> {
        let inspect = self.docker.inspect_container(runtime_container_id, None).await?;
        Ok(inspect
            .network_settings
            .and_then(|n| n.ip_address)
            .filter(|ip| !ip.is_empty()))
    }

    /// Polled every ≈5s by the execution task (spec §4.9 step h).
    pub async fn poll_exit(&self, runtime_container_id: &str) -> anyhow::Result<ExitOutcome> {
        let inspect = self.docker.inspect_container(runtime_container_id, None).await?;
        let state = inspect.state.unwrap_or_default();
        if state.running.unwrap_or(false) {
            return Ok(ExitOutcome::Running);
        }
        Ok(ExitOutcome::Exited { code: state.exit_code.unwrap_or(-1) })
    }

    /// Blocks until the container exits, used only by tests that want a
    /// deterministic wait instead of polling.
    #[cfg(test)]
    pub async fn wait(&self, runtime_container_id: &str) -> anyhow::Result<i64> {
        let mut stream = self.docker.wait_container(runtime_container_id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Ok(-1),
        }
    }

    /// Exec probe for the health monitor (spec §4.11 "Exec: ... healthy iff
    /// the command exits 0").
    pub async fn exec(&self, runtime_container_id: &str, command: Vec<String>) -> anyhow::Result<bool> {
        let exec = self
            .docker
            .create_exec(
                runtime_container_id,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        if let StartExecResults::Attached { mut output, .. } = self.docker.start_exec(&exec.id, None).await? {
            while output.next().await.is_some() {}
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(inspect.exit_code == Some(0))
    }
}

/// Translates `MountSpec` volume bind specs (already resolved to host paths
/// by the volume mounter) and secret tmpfs mounts into bollard `HostConfig`
/// bind strings.
pub fn build_binds(mounts: &[MountSpec], volume_host_paths: &HashMap<String, String>, secret_mounts: &[(String, String)]) -> ResolvedMounts {
    let mut binds = Vec::new();
    for mount in mounts {
        if let Some(host_path) = volume_host_paths.get(&mount.volume_name) {
            let suffix = if mount.read_only { ":ro" } else { "" };
            binds.push(format!("{host_path}:{}{suffix}", mount.container_path));
        }
    }
    for (host_path, container_path) in secret_mounts {
        binds.push(format!("{host_path}:{container_path}:ro"));
    }
    ResolvedMounts { binds }
}
