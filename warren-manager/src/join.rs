//! Client-side cluster join flow (SPEC_FULL.md §B): a manager started with
//! `--join <address> --token <token>` bootstraps a certificate from the
//! target manager over an unverified connection, then calls `JoinCluster`
//! over mTLS so the target's Raft leader adds it as a voter. Mirrors the
//! worker's bootstrap-then-mTLS connector (`warren-worker/src/transport.rs`)
//! since both sides of the RPC surface use the same unverified-then-mTLS
//! hand-off (spec §4.4).

use std::path::{Path, PathBuf};

use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tower::service_fn;
use tracing::info;

use warren_proto::pb::cluster_service_client::ClusterServiceClient;
use warren_proto::pb::{JoinClusterRequest, RequestCertificateRequest};
use warren_security::tls;

fn cert_paths(data_dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
    let dir = data_dir.join("cert");
    (dir.join("node.crt"), dir.join("node.key"), dir.join("ca.crt"))
}

async fn connect_bootstrap(join_address: &str) -> anyhow::Result<Channel> {
    let addr = join_address.to_string();
    let tls_config = tls::bootstrap_client_config();
    let connector = tokio_rustls::TlsConnector::from(tls_config);
    let server_name: rustls::pki_types::ServerName<'static> =
        rustls::pki_types::ServerName::try_from("warren-bootstrap".to_string())?;

    let channel = Endpoint::from_static("https://warren-bootstrap")
        .connect_with_connector(service_fn(move |_: http::Uri| {
            let addr = addr.clone();
            let connector = connector.clone();
            let server_name = server_name.clone();
            async move {
                let tcp = TcpStream::connect(&addr).await?;
                let tls_stream = connector.connect(server_name, tcp).await?;
                Ok::<_, std::io::Error>(TokioIo::new(tls_stream))
            }
        }))
        .await?;
    Ok(channel)
}

async fn connect_mtls(
    join_address: &str,
    ca_certificate_pem: &str,
    certificate_pem: &str,
    private_key_pem: &str,
) -> anyhow::Result<Channel> {
    let uri = format!("https://{join_address}");
    let host = join_address.rsplit_once(':').map(|(h, _)| h).unwrap_or(join_address);

    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(ca_certificate_pem))
        .identity(Identity::from_pem(certificate_pem, private_key_pem))
        .domain_name(host);

    let channel = Endpoint::from_shared(uri)?
        .tls_config(tls)?
        .connect_timeout(std::time::Duration::from_secs(5))
        .connect()
        .await?;
    Ok(channel)
}

/// Runs once at startup for a non-bootstrap manager that was given a join
/// target: obtains a certificate from `join_address` (cached under
/// `data_dir/cert` exactly like the worker caches its own), then calls
/// `JoinCluster` so the target leader adds this node as a Raft voter.
/// Idempotent across restarts — a cached certificate skips straight to the
/// `JoinCluster` call, which is harmless to repeat if this node is already a
/// voter.
pub async fn join_cluster(
    data_dir: &Path,
    self_address: &str,
    join_address: &str,
    token: &str,
) -> anyhow::Result<()> {
    let node_id = warren_raft::node_id_from_str(self_address).to_string();
    let (cert_path, key_path, ca_path) = cert_paths(data_dir);

    let cached = (
        std::fs::read_to_string(&cert_path),
        std::fs::read_to_string(&key_path),
        std::fs::read_to_string(&ca_path),
    );
    let (certificate_pem, private_key_pem, ca_certificate_pem) = match cached {
        (Ok(c), Ok(k), Ok(ca)) => (c, k, ca),
        _ => {
            info!(%node_id, %join_address, "requesting join certificate");
            let channel = connect_bootstrap(join_address).await?;
            let mut client = ClusterServiceClient::new(channel);
            let response = client
                .request_certificate(tonic::Request::new(RequestCertificateRequest {
                    node_id: node_id.clone(),
                    token: token.to_string(),
                    client_only: false,
                }))
                .await?
                .into_inner();

            use std::os::unix::fs::PermissionsExt;
            std::fs::create_dir_all(cert_path.parent().unwrap())?;
            std::fs::write(&cert_path, &response.certificate_pem)?;
            std::fs::write(&key_path, &response.private_key_pem)?;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
            std::fs::write(&ca_path, &response.ca_certificate_pem)?;

            (response.certificate_pem, response.private_key_pem, response.ca_certificate_pem)
        }
    };

    let channel = connect_mtls(join_address, &ca_certificate_pem, &certificate_pem, &private_key_pem).await?;
    let mut client = ClusterServiceClient::new(channel);
    client
        .join_cluster(tonic::Request::new(JoinClusterRequest {
            node_id,
            address: self_address.to_string(),
            token: token.to_string(),
        }))
        .await?;
    info!(%join_address, "joined cluster");
    Ok(())
}
