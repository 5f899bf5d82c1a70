//! AES-256-GCM encryption of user secret payloads (spec §4.5).
//!
//! The cluster key is derived once, at construction, from the cluster
//! identifier (spec §8's "Global mutable state" note: no component reads a
//! process-wide singleton for it).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::{Result, SecurityError};

const NONCE_LEN: usize = 12;

pub struct SecretsManager {
    cipher: Aes256Gcm,
}

impl SecretsManager {
    /// Derives a 256-bit key from the cluster identifier via HKDF-SHA256.
    pub fn new(cluster_identifier: &[u8]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&derive_key(cluster_identifier, b"warren-secrets-v1")),
        }
    }

    /// Encrypts `plaintext`, returning `nonce || ciphertext`. The nonce is
    /// fresh per call and does not need to be tracked separately: it's
    /// prepended to the stored ciphertext (spec S5: "first 12 bytes are a
    /// nonce").
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut out = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SecurityError::Crypto(e.to_string()))?;

        let mut result = nonce_bytes.to_vec();
        result.append(&mut out);
        Ok(result)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(SecurityError::DecryptionFailed);
        }
        let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, body)
            .map_err(|_| SecurityError::DecryptionFailed)
    }
}

/// Derives a 256-bit AES key from arbitrary input key material via
/// HKDF-SHA256. Shared with the CA's root-key-at-rest encryption so both use
/// the same derivation, distinguished only by the HKDF `info` label.
pub fn derive_key(ikm: &[u8], info: &[u8]) -> Key<Aes256Gcm> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm).expect("32 bytes is a valid HKDF output length");
    Key::<Aes256Gcm>::from(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_recovers_plaintext() {
        let mgr = SecretsManager::new(b"test-cluster");
        let plaintext = b"secret";
        let ciphertext = mgr.encrypt(plaintext).unwrap();
        assert_eq!(&ciphertext[..NONCE_LEN].len(), &NONCE_LEN);
        assert_eq!(mgr.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let mgr = SecretsManager::new(b"test-cluster");
        let mut ciphertext = mgr.encrypt(b"secret").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(mgr.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn different_clusters_derive_different_keys() {
        let a = SecretsManager::new(b"cluster-a");
        let b = SecretsManager::new(b"cluster-b");
        let ciphertext = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&ciphertext).is_err());
    }
}
