//! mTLS transport config shared by manager and worker (spec §4.4: "Minimum
//! TLS version is 1.3", mutual certificate verification once a node holds
//! credentials).

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::{Result, SecurityError};

fn parse_cert_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SecurityError::Certificate(e.to_string()))
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| SecurityError::Certificate(e.to_string()))?
        .ok_or_else(|| SecurityError::Certificate("no private key found in PEM".into()))
}

fn root_store(ca_certificate_pem: &str) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in parse_cert_chain(ca_certificate_pem)? {
        store
            .add(cert)
            .map_err(|e| SecurityError::Certificate(e.to_string()))?;
    }
    Ok(store)
}

/// Server-side rustls config: requires the peer to present a certificate
/// signed by the cluster CA — mTLS, not one-way TLS.
pub fn server_config(
    ca_certificate_pem: &str,
    certificate_pem: &str,
    private_key_pem: &str,
) -> Result<Arc<ServerConfig>> {
    let roots = root_store(ca_certificate_pem)?;
    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| SecurityError::Certificate(e.to_string()))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(parse_cert_chain(certificate_pem)?, parse_private_key(private_key_pem)?)
        .map_err(|e| SecurityError::Certificate(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Client-side rustls config presenting this node's certificate and
/// trusting only the cluster CA.
pub fn client_config(
    ca_certificate_pem: &str,
    certificate_pem: &str,
    private_key_pem: &str,
) -> Result<Arc<ClientConfig>> {
    let roots = root_store(ca_certificate_pem)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(parse_cert_chain(certificate_pem)?, parse_private_key(private_key_pem)?)
        .map_err(|e| SecurityError::Certificate(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Bootstrap-only client config: server verification disabled, used for the
/// very first `RequestCertificate` call before a node holds any cluster
/// credentials (spec §4.4's "InsecureSkipVerify=true" flow).
pub fn bootstrap_client_config() -> Arc<ClientConfig> {
    #[derive(Debug)]
    struct NoVerify;

    impl rustls::client::danger::ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();

    Arc::new(config)
}
