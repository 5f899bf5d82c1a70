//! Per-host worker/hybrid agent process (spec §4.9): certificate bootstrap,
//! node registration, and the heartbeat/sync loops that drive the execution
//! pipeline.

pub mod containers;
pub mod dns;
pub mod health;
pub mod ports;
pub mod runtime;
pub mod secrets;
pub mod transport;
pub mod volumes;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tonic::Request;
use tracing::info;

use warren_proto::pb::cluster_service_client::ClusterServiceClient;
use warren_proto::pb::{NodeRole, RegisterNodeRequest, RequestCertificateRequest, ResourceSpec};

use crate::containers::{Agent, AgentConfig};
use crate::runtime::ContainerRuntime;
use crate::transport::Backoff;

const INITIAL_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);
const MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(30);

/// Mirrors spec §6's worker config, supplemented with the cluster name
/// (needed to derive the same secret-decryption key the manager uses,
/// spec §4.5) and the DNS settings that make `resolv.conf` generation
/// possible without a separate RPC round trip per container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub node_id: String,
    pub manager_address: String,
    pub data_dir: PathBuf,
    pub join_token: String,
    pub cluster_name: String,
    pub hybrid: bool,
    pub declared_cpu_cores_milli: u64,
    pub declared_memory_bytes: u64,
    pub declared_disk_bytes: u64,
    pub runtime_socket: Option<String>,
    pub manager_ip: IpAddr,
    pub dns_domain: String,
    pub dns_upstreams: Vec<IpAddr>,
}

struct CertMaterial {
    certificate_pem: String,
    private_key_pem: String,
    ca_certificate_pem: String,
}

fn cert_paths(data_dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
    let dir = data_dir.join("cert");
    (dir.join("node.crt"), dir.join("node.key"), dir.join("ca.crt"))
}

fn load_cert_material(data_dir: &Path) -> Option<CertMaterial> {
    let (cert, key, ca) = cert_paths(data_dir);
    Some(CertMaterial {
        certificate_pem: std::fs::read_to_string(cert).ok()?,
        private_key_pem: std::fs::read_to_string(key).ok()?,
        ca_certificate_pem: std::fs::read_to_string(ca).ok()?,
    })
}

fn store_cert_material(data_dir: &Path, material: &CertMaterial) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let (cert, key, ca) = cert_paths(data_dir);
    std::fs::create_dir_all(cert.parent().unwrap())?;
    std::fs::write(&cert, &material.certificate_pem)?;
    std::fs::write(&key, &material.private_key_pem)?;
    std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o600))?;
    std::fs::write(&ca, &material.ca_certificate_pem)?;
    Ok(())
}

/// Spec §4.9 step 1: bootstrap a certificate if none is cached yet, over an
/// unverified TLS connection, then never use that connection again.
async fn ensure_certificate(config: &WorkerConfig) -> anyhow::Result<CertMaterial> {
    if let Some(material) = load_cert_material(&config.data_dir) {
        return Ok(material);
    }

    info!(node_id = %config.node_id, "requesting initial certificate from manager");
    let channel = transport::connect_bootstrap(&config.manager_address).await?;
    let mut client = ClusterServiceClient::new(channel);

    let response = client
        .request_certificate(Request::new(RequestCertificateRequest {
            node_id: config.node_id.clone(),
            token: config.join_token.clone(),
            client_only: true,
        }))
        .await?
        .into_inner();

    let material = CertMaterial {
        certificate_pem: response.certificate_pem,
        private_key_pem: response.private_key_pem,
        ca_certificate_pem: response.ca_certificate_pem,
    };
    store_cert_material(&config.data_dir, &material)?;
    Ok(material)
}

/// Connects over mTLS, retrying with bounded backoff until the manager
/// becomes reachable (spec §4.9 "autonomy on disconnection").
async fn connect_with_retry(config: &WorkerConfig, material: &CertMaterial) -> ClusterServiceClient<tonic::transport::Channel> {
    let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
    loop {
        match transport::connect_mtls(
            &config.manager_address,
            &material.ca_certificate_pem,
            &material.certificate_pem,
            &material.private_key_pem,
        )
        .await
        {
            Ok(channel) => return ClusterServiceClient::new(channel),
            Err(e) => {
                tracing::warn!(error = %e, "failed to connect to manager, retrying");
                backoff.wait().await;
            }
        }
    }
}

/// Runs the worker agent until the process is terminated: bootstraps a
/// certificate, registers the node, then runs the heartbeat and sync loops
/// concurrently until either returns (process exit signals stopping both).
pub async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;

    let material = ensure_certificate(&config).await?;
    let mut client = connect_with_retry(&config, &material).await;

    let role = if config.hybrid { NodeRole::Hybrid } else { NodeRole::Worker };
    let declared_resources = ResourceSpec {
        cpu_cores_milli: config.declared_cpu_cores_milli,
        memory_bytes: config.declared_memory_bytes,
        disk_bytes: config.declared_disk_bytes,
    };

    let registration = client
        .register_node(Request::new(RegisterNodeRequest {
            node_id: config.node_id.clone(),
            role: role as i32,
            address: config.manager_address.clone(),
            capacity: Some(declared_resources.clone()),
            labels: Default::default(),
        }))
        .await?
        .into_inner();
    info!(overlay_address = %registration.overlay_address, "registered with cluster");

    let runtime = Arc::new(ContainerRuntime::connect(config.runtime_socket.as_deref())?);

    let agent = Arc::new(Agent::new(
        AgentConfig {
            node_id: config.node_id.clone(),
            data_dir: config.data_dir.clone(),
            dns_domain: config.dns_domain.clone(),
            manager_ip: config.manager_ip,
            dns_upstreams: config.dns_upstreams.clone(),
        },
        client,
        runtime,
        declared_resources,
        &config.cluster_name,
    ));

    tokio::select! {
        _ = agent.heartbeat_loop() => {}
        _ = agent.sync_loop() => {}
    }
    Ok(())
}
