//! Control-plane process: wires the Raft node, RPC surface, scheduler,
//! reconciler, DNS resolver and event broker into one running manager.
//!
//! Grounded on the teacher's `manager::manager::Manager::run` top-level
//! wiring: open the embedded database, start consensus, spawn the
//! background loops, then serve RPCs — generalized from the teacher's
//! single TCP listener into the network listener plus the read-only local
//! socket required by spec §4.6.

pub mod admin;
pub mod dns;
pub mod events;
pub mod join;
pub mod propose;
pub mod reconciler;
pub mod scheduler;
pub mod service;
pub mod time;
pub mod validation;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tracing::{info, warn};

use warren_proto::pb::cluster_service_server::ClusterServiceServer;
use warren_proto::pb::raft_service_server::RaftServiceServer;
use warren_raft::RaftNode;
use warren_security::{CertificateAuthority, SecretsManager, TokenManager};
use warren_store::{Fsm, Store};

use crate::admin::ReadOnlyLayer;
use crate::dns::DnsHandler;
use crate::events::EventBroker;
use crate::reconciler::Reconciler;
use crate::scheduler::Scheduler;
use crate::service::ClusterServiceImpl;

const JOIN_TOKEN_TTL: Duration = Duration::from_secs(24 * 3600);
const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const CA_WAIT_POLL: Duration = Duration::from_millis(200);
const CA_WAIT_ATTEMPTS: usize = 150; // ~30s

/// Mirrors spec §6's `ManagerConfig`: loaded from TOML, overridable by
/// `WARREN_*` environment variables at the binary layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub data_dir: PathBuf,
    pub cluster_name: String,
    pub bind_address: String,
    pub admin_socket_path: PathBuf,
    pub dns_bind_address: SocketAddr,
    pub dns_domain: String,
    pub dns_upstreams: Vec<SocketAddr>,
    /// True for the single node that installs the first Raft voter. All
    /// other managers join an existing cluster via `JoinCluster` (spec §4.2
    /// "Bootstrap installs exactly one voter").
    pub bootstrap: bool,
    /// `--join <address>` target: an existing manager to call `JoinCluster`
    /// against instead of bootstrapping. Ignored when `bootstrap` is true.
    pub join_address: Option<String>,
    /// `--token <token>` paired with `join_address` (SPEC_FULL.md §B).
    pub join_token: Option<String>,
}

pub struct Manager {
    pub store: Arc<Store>,
    pub raft: Arc<RaftNode>,
    pub ca: Arc<CertificateAuthority>,
    pub secrets: Arc<SecretsManager>,
    pub tokens: Arc<TokenManager>,
    pub events: Arc<EventBroker>,
}

impl Manager {
    /// Opens the store, starts Raft, and waits for CA material to exist —
    /// immediately on the bootstrap node, or once it arrives via snapshot
    /// replication on a node that joined an existing cluster.
    pub async fn start(config: &ManagerConfig) -> anyhow::Result<Self> {
        let store = Arc::new(Store::open(&config.data_dir)?);
        let fsm = Arc::new(Fsm::new(store.clone()));

        let peers = if config.bootstrap {
            vec![(warren_raft::node_id_from_str(&config.bind_address), config.bind_address.clone())]
        } else {
            Vec::new()
        };

        if !config.bootstrap {
            if let (Some(join_address), Some(token)) = (&config.join_address, &config.join_token) {
                join::join_cluster(&config.data_dir, &config.bind_address, join_address, token).await?;
            }
        }

        let raft = Arc::new(
            warren_raft::start(
                config.cluster_name.clone(),
                &config.data_dir,
                &config.bind_address,
                peers,
                fsm,
            )
            .await?,
        );

        if config.bootstrap && store.get_ca_material()?.is_none() {
            bootstrap_ca(&store, &config.cluster_name)?;
        }

        let material = wait_for_ca_material(&store).await?;
        let ca = Arc::new(CertificateAuthority::load(
            config.cluster_name.as_bytes(),
            &material.root_certificate_pem,
            &material.encrypted_root_key_pem,
        )?);

        let secrets = Arc::new(SecretsManager::new(config.cluster_name.as_bytes()));
        let tokens = TokenManager::new(JOIN_TOKEN_TTL);
        let events = Arc::new(EventBroker::new());

        Ok(Self { store, raft, ca, secrets, tokens, events })
    }

    /// Spawns the scheduler, reconciler, token sweep, and DNS resolver. Each
    /// is a long-running background task; none of them block RPC serving.
    pub fn spawn_background_tasks(&self, config: &ManagerConfig) {
        tokio::spawn(Scheduler::new(self.store.clone(), self.raft.clone()).run_loop());
        tokio::spawn(Reconciler::new(self.store.clone(), self.raft.clone()).run_loop());
        tokio::spawn(self.tokens.clone().sweep_expired_loop(TOKEN_SWEEP_INTERVAL));
        self.spawn_dns(config);
    }

    fn spawn_dns(&self, config: &ManagerConfig) {
        let handler = DnsHandler::new(self.store.clone(), config.dns_domain.clone());
        let bind_address = config.dns_bind_address;
        tokio::spawn(async move {
            let mut server = hickory_server::ServerFuture::new(handler);
            match tokio::net::UdpSocket::bind(bind_address).await {
                Ok(socket) => server.register_socket(socket),
                Err(e) => {
                    warn!(error = %e, "failed to bind DNS resolver socket");
                    return;
                }
            }
            if let Err(e) = server.block_until_done().await {
                warn!(error = %e, "DNS resolver stopped");
            }
        });
    }

    fn cluster_service(&self) -> ClusterServiceServer<ClusterServiceImpl> {
        ClusterServiceServer::new(ClusterServiceImpl::new(
            self.store.clone(),
            self.raft.clone(),
            self.ca.clone(),
            self.secrets.clone(),
            self.tokens.clone(),
            self.events.clone(),
        ))
    }

    /// Serves the TCP + mTLS listener (`ClusterService` and `RaftService`,
    /// both gRPC) until `shutdown` resolves.
    pub async fn serve_network(
        &self,
        bind_address: &str,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let node_id = warren_raft::node_id_from_str(bind_address).to_string();
        let host = bind_address.rsplit_once(':').map(|(host, _)| host).unwrap_or(bind_address);
        let issued = self.ca.issue_manager_certificate(&node_id, host)?;
        let identity = Identity::from_pem(issued.certificate_pem, issued.private_key_pem);
        let tls = ServerTlsConfig::new()
            .identity(identity)
            .client_ca_root(tonic::transport::Certificate::from_pem(self.ca.root_certificate_pem()));

        let addr: SocketAddr = bind_address.parse()?;
        info!(%addr, "serving cluster + raft RPCs over mTLS");

        Server::builder()
            .tls_config(tls)?
            .add_service(self.cluster_service())
            .add_service(RaftServiceServer::new(warren_raft::RaftServer::new(self.raft.raft.clone())))
            .serve_with_shutdown(addr, shutdown)
            .await?;
        Ok(())
    }

    /// Serves the read-only local administrative socket (spec §4.6): no
    /// client certificate required, but every non-`List`/`Get`/etc. RPC is
    /// rejected before it reaches the service implementation.
    pub async fn serve_admin_socket(
        &self,
        socket_path: &std::path::Path,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "serving read-only admin socket");

        Server::builder()
            .layer(ReadOnlyLayer)
            .add_service(self.cluster_service())
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
            .await?;
        Ok(())
    }
}

fn bootstrap_ca(store: &Store, cluster_name: &str) -> anyhow::Result<()> {
    let ca = CertificateAuthority::bootstrap(cluster_name.as_bytes())?;
    store.put_ca_material(&warren_proto::pb::CaMaterial {
        root_certificate_pem: ca.root_certificate_pem().to_string(),
        encrypted_root_key_pem: ca.encrypted_root_key_pem()?,
    })?;
    Ok(())
}

async fn wait_for_ca_material(store: &Store) -> anyhow::Result<warren_proto::pb::CaMaterial> {
    for _ in 0..CA_WAIT_ATTEMPTS {
        if let Some(material) = store.get_ca_material()? {
            return Ok(material);
        }
        tokio::time::sleep(CA_WAIT_POLL).await;
    }
    anyhow::bail!("timed out waiting for CA material to replicate from the cluster leader")
}
