//! gRPC channel construction for the worker's two connection states (spec
//! §4.9 step 1): an insecure bootstrap channel used only for the first
//! `RequestCertificate` call, and the real mTLS channel used for everything
//! after.
//!
//! `tonic`'s `ClientTlsConfig` covers the post-bootstrap case directly. The
//! bootstrap case needs server verification disabled, which `ClientTlsConfig`
//! has no knob for, so that path drives `tokio-rustls` through a custom
//! connector instead — grounded on the documented `connect_with_connector`
//! pattern for non-standard transports, best-effort since no pack example
//! wires a custom connector end to end.

use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tower::service_fn;

use warren_security::tls;

/// Connects with server verification disabled. Used exactly once, before the
/// worker holds any certificate signed by the cluster CA.
pub async fn connect_bootstrap(manager_address: &str) -> anyhow::Result<Channel> {
    let addr = manager_address.to_string();
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

/// Connects with full mutual verification: the worker presents its own
/// signed certificate and trusts only the cluster root.
pub async fn connect_mtls(
    manager_address: &str,
    ca_certificate_pem: &str,
    certificate_pem: &str,
    private_key_pem: &str,
) -> anyhow::Result<Channel> {
    let uri = if manager_address.starts_with("http") {
        manager_address.to_string()
    } else {
        format!("https://{manager_address}")
    };
    let host = manager_address.rsplit_once(':').map(|(h, _)| h).unwrap_or(manager_address);

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

/// Doubling backoff with a ceiling, used by every worker reconnect loop
/// (spec §4.9 "retries connection with bounded backoff").
pub struct Backoff {
    current: std::time::Duration,
    max: std::time::Duration,
}

impl Backoff {
    pub fn new(initial: std::time::Duration, max: std::time::Duration) -> Self {
        Self { current: initial, max }
    }

    pub async fn wait(&mut self) {
        tokio::time::sleep(self.current).await;
        self.current = std::cmp::min(self.current * 2, self.max);
    }
}
