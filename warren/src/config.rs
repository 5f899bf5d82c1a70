//! TOML config loading with `WARREN_*` environment overrides
//! (SPEC_FULL.md §A.3).

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Manager,
    Worker,
    Hybrid,
}

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    pub mode: Mode,
    pub manager: Option<ManagerConfigFile>,
    pub worker: Option<WorkerConfigFile>,
}

#[derive(Debug, Deserialize)]
pub struct ManagerConfigFile {
    pub data_dir: PathBuf,
    pub cluster_name: String,
    pub bind_address: String,
    pub admin_socket_path: PathBuf,
    pub dns_bind_address: SocketAddr,
    #[serde(default = "default_dns_domain")]
    pub dns_domain: String,
    #[serde(default)]
    pub dns_upstreams: Vec<SocketAddr>,
    #[serde(default)]
    pub bootstrap: bool,
    /// Set by `--join`/`--token` at the CLI layer rather than the config
    /// file in the common case, but also accepted here for completeness.
    #[serde(default)]
    pub join_address: Option<String>,
    #[serde(default)]
    pub join_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerConfigFile {
    pub node_id: String,
    pub manager_address: String,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub join_token: String,
    pub cluster_name: String,
    #[serde(default)]
    pub hybrid: bool,
    pub declared_cpu_cores_milli: u64,
    pub declared_memory_bytes: u64,
    pub declared_disk_bytes: u64,
    pub runtime_socket: Option<String>,
    pub manager_ip: IpAddr,
    #[serde(default = "default_dns_domain")]
    pub dns_domain: String,
    #[serde(default)]
    pub dns_upstreams: Vec<IpAddr>,
}

fn default_dns_domain() -> String {
    "warren".to_string()
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<ResolvedConfig> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let parsed: DaemonConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;

        let manager = parsed.manager.map(|m| m.into_resolved_with_env());
        let worker = parsed.worker.map(|w| w.into_resolved_with_env());

        Ok(ResolvedConfig { mode: parsed.mode, manager, worker })
    }
}

/// The config actually consumed by `main`: manager/worker fields converted
/// into the types `warren-manager`/`warren-worker` expect, with `WARREN_*`
/// overrides already applied.
pub struct ResolvedConfig {
    pub mode: Mode,
    pub manager: Option<warren_manager::ManagerConfig>,
    pub worker: Option<warren_worker::WorkerConfig>,
}

fn env_override(key: &str, current: String) -> String {
    std::env::var(key).unwrap_or(current)
}

impl ManagerConfigFile {
    fn into_resolved_with_env(self) -> warren_manager::ManagerConfig {
        warren_manager::ManagerConfig {
            data_dir: PathBuf::from(env_override("WARREN_DATA_DIR", self.data_dir.to_string_lossy().into_owned())),
            cluster_name: env_override("WARREN_CLUSTER_NAME", self.cluster_name),
            bind_address: env_override("WARREN_BIND_ADDRESS", self.bind_address),
            admin_socket_path: self.admin_socket_path,
            dns_bind_address: self.dns_bind_address,
            dns_domain: env_override("WARREN_DNS_DOMAIN", self.dns_domain),
            dns_upstreams: self.dns_upstreams,
            bootstrap: std::env::var("WARREN_BOOTSTRAP").map(|v| v == "true").unwrap_or(self.bootstrap),
            join_address: std::env::var("WARREN_JOIN_ADDRESS").ok().or(self.join_address),
            join_token: std::env::var("WARREN_JOIN_TOKEN").ok().or(self.join_token),
        }
    }
}

impl WorkerConfigFile {
    fn into_resolved_with_env(self) -> warren_worker::WorkerConfig {
        warren_worker::WorkerConfig {
            node_id: env_override("WARREN_NODE_ID", self.node_id),
            manager_address: env_override("WARREN_MANAGER_ADDRESS", self.manager_address),
            data_dir: PathBuf::from(env_override("WARREN_DATA_DIR", self.data_dir.to_string_lossy().into_owned())),
            join_token: env_override("WARREN_JOIN_TOKEN", self.join_token),
            cluster_name: env_override("WARREN_CLUSTER_NAME", self.cluster_name),
            hybrid: self.hybrid,
            declared_cpu_cores_milli: self.declared_cpu_cores_milli,
            declared_memory_bytes: self.declared_memory_bytes,
            declared_disk_bytes: self.declared_disk_bytes,
            runtime_socket: self.runtime_socket,
            manager_ip: self.manager_ip,
            dns_domain: env_override("WARREN_DNS_DOMAIN", self.dns_domain),
            dns_upstreams: self.dns_upstreams,
        }
    }
}
