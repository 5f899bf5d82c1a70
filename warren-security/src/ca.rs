//! Embedded certificate authority (spec §4.4).
//!
//! A self-signed RSA root is generated on first bootstrap and persisted
//! (encrypted) via the Store; every subsequent manager start loads it back
//! instead of regenerating. Leaf certificates are short-lived and signed by
//! that root: manager certs carry DNS/IP SANs derived from the bind
//! address, worker and CLI certs are client-only.

use rcgen::{
    CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose, SanType,
    PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::secrets::derive_key;
use crate::{Result, SecurityError};

const ROOT_KEY_BITS: usize = 2048;
const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 30;

/// Issued certificate plus the private key that goes with it, both PEM.
pub struct IssuedCertificate {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

/// Holds the CA's root key pair in memory for the lifetime of the manager
/// process. The encrypted-at-rest form lives in `Store::get_ca_material` /
/// `put_ca_material`; `CertificateAuthority` only ever deals with the
/// decrypted key pair.
pub struct CertificateAuthority {
    root_key_pair: KeyPair,
    root_cert_pem: String,
    root_cert: rcgen::Certificate,
    cluster_key: aes_gcm::Key<aes_gcm::Aes256Gcm>,
}

impl CertificateAuthority {
    /// Generates a brand-new self-signed root. Called exactly once, on the
    /// first bootstrap of a cluster; the result is encrypted and persisted
    /// by the caller via `encrypted_root_key_pem`.
    pub fn bootstrap(cluster_identifier: &[u8]) -> Result<Self> {
        let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), ROOT_KEY_BITS)
            .map_err(|e| SecurityError::Crypto(e.to_string()))?;
        let pkcs8_der = rsa_key
            .to_pkcs8_der()
            .map_err(|e| SecurityError::Crypto(e.to_string()))?;

        let key_pair = KeyPair::from_der_and_sign_algo(pkcs8_der.as_bytes(), &PKCS_RSA_SHA256)
            .map_err(|e| SecurityError::Certificate(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| SecurityError::Certificate(e.to_string()))?;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = in_days(ROOT_VALIDITY_DAYS);
        params.distinguished_name = root_dn();

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| SecurityError::Certificate(e.to_string()))?;

        let cluster_key = derive_key(cluster_identifier, b"warren-ca-root-key-v1");

        Ok(Self {
            root_cert_pem: cert.pem(),
            root_key_pair: key_pair,
            root_cert: cert,
            cluster_key,
        })
    }

    /// Loads a previously persisted root: the encrypted private key plus the
    /// plaintext root certificate, both from `Store::get_ca_material`.
    pub fn load(
        cluster_identifier: &[u8],
        root_certificate_pem: &str,
        encrypted_root_key_pem: &[u8],
    ) -> Result<Self> {
        let cluster_key = derive_key(cluster_identifier, b"warren-ca-root-key-v1");
        let key_pem = decrypt_pem(&cluster_key, encrypted_root_key_pem)?;

        let key_pair = KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256)
            .map_err(|e| SecurityError::Certificate(e.to_string()))?;

        let params = CertificateParams::from_ca_cert_pem(root_certificate_pem)
            .map_err(|e| SecurityError::Certificate(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| SecurityError::Certificate(e.to_string()))?;

        Ok(Self {
            root_cert_pem: root_certificate_pem.to_string(),
            root_key_pair: key_pair,
            root_cert: cert,
            cluster_key,
        })
    }

    pub fn root_certificate_pem(&self) -> &str {
        &self.root_cert_pem
    }

    /// The root private key, encrypted with the cluster key, ready to be
    /// written into `CaMaterial::encrypted_root_key_pem`.
    pub fn encrypted_root_key_pem(&self) -> Result<Vec<u8>> {
        encrypt_pem(&self.cluster_key, &self.root_key_pair.serialize_pem())
    }

    /// Issues a manager certificate with DNS/IP SANs derived from the bind
    /// address (spec §4.4: "Manager certificates include DNS names and IP
    /// SANs derived from the bind address").
    pub fn issue_manager_certificate(&self, node_id: &str, bind_host: &str) -> Result<IssuedCertificate> {
        let san = match bind_host.parse::<std::net::IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                bind_host
                    .to_string()
                    .try_into()
                    .map_err(|e: rcgen::Error| SecurityError::Certificate(e.to_string()))?,
            ),
        };
        self.issue(node_id, vec![san], false)
    }

    /// Issues a worker or CLI certificate: client-only, no SANs required.
    pub fn issue_client_certificate(&self, node_id: &str) -> Result<IssuedCertificate> {
        self.issue(node_id, Vec::new(), true)
    }

    fn issue(&self, node_id: &str, sans: Vec<SanType>, client_only: bool) -> Result<IssuedCertificate> {
        // `ring` (rcgen's default backend) cannot generate RSA keys, only
        // sign with them, so every leaf key is minted via the `rsa` crate
        // and wrapped the same way the root key is.
        let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), ROOT_KEY_BITS)
            .map_err(|e| SecurityError::Crypto(e.to_string()))?;
        let der = rsa_key
            .to_pkcs8_der()
            .map_err(|e| SecurityError::Crypto(e.to_string()))?;
        let key_pair = KeyPair::from_der_and_sign_algo(der.as_bytes(), &PKCS_RSA_SHA256)
            .map_err(|e| SecurityError::Certificate(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| SecurityError::Certificate(e.to_string()))?;
        params.is_ca = IsCa::NoCa;
        params.subject_alt_names = sans;
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = in_days(LEAF_VALIDITY_DAYS);
        params.key_usages = if client_only {
            vec![KeyUsagePurpose::DigitalSignature]
        } else {
            vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment]
        };
        params.distinguished_name = leaf_dn(node_id);

        let cert = params
            .signed_by(&key_pair, &self.root_cert, &self.root_key_pair)
            .map_err(|e| SecurityError::Certificate(e.to_string()))?;

        Ok(IssuedCertificate {
            certificate_pem: cert.pem(),
            private_key_pem: key_pair.serialize_pem(),
        })
    }
}

fn root_dn() -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "warren cluster root");
    dn
}

fn leaf_dn(node_id: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, node_id);
    dn
}

fn in_days(days: i64) -> OffsetDateTime {
    OffsetDateTime::now_utc() + TimeDuration::days(days)
}

fn encrypt_pem(key: &aes_gcm::Key<aes_gcm::Aes256Gcm>, pem: &str) -> Result<Vec<u8>> {
    use aes_gcm::aead::{Aead, KeyInit};
    use aes_gcm::{Aes256Gcm, Nonce};
    use rand::RngCore;

    let cipher = Aes256Gcm::new(key);
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut ciphertext = cipher
        .encrypt(nonce, pem.as_bytes())
        .map_err(|e| SecurityError::Crypto(e.to_string()))?;
    let mut out = nonce_bytes.to_vec();
    out.append(&mut ciphertext);
    Ok(out)
}

fn decrypt_pem(key: &aes_gcm::Key<aes_gcm::Aes256Gcm>, data: &[u8]) -> Result<String> {
    use aes_gcm::aead::{Aead, KeyInit};
    use aes_gcm::{Aes256Gcm, Nonce};

    if data.len() < 12 {
        return Err(SecurityError::DecryptionFailed);
    }
    let (nonce_bytes, body) = data.split_at(12);
    let cipher = Aes256Gcm::new(key);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), body)
        .map_err(|_| SecurityError::DecryptionFailed)?;
    String::from_utf8(plaintext).map_err(|_| SecurityError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_then_reload_round_trips_root_key() {
        let ca = CertificateAuthority::bootstrap(b"test-cluster").unwrap();
        let encrypted = ca.encrypted_root_key_pem().unwrap();
        let reloaded =
            CertificateAuthority::load(b"test-cluster", ca.root_certificate_pem(), &encrypted).unwrap();
        assert_eq!(ca.root_certificate_pem(), reloaded.root_certificate_pem());
    }

    #[test]
    fn issued_manager_certificate_embeds_bind_address() {
        let ca = CertificateAuthority::bootstrap(b"test-cluster").unwrap();
        let issued = ca.issue_manager_certificate("node-1", "10.0.0.5").unwrap();
        assert!(issued.certificate_pem.contains("BEGIN CERTIFICATE"));
    }
}
