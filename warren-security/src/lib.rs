//! Cluster security primitives: join tokens, the embedded CA, secret
//! encryption, and the mTLS transport config shared by manager and worker.
//!
//! The teacher has no directly grounded equivalent for any of this (see
//! DESIGN.md), so each module is authored in the teacher's idiom — typed
//! errors via `thiserror`, `Arc<Mutex<State>>` around mutable state the way
//! `service::resolver::ServiceResolver` splits `Shared`/`State`, background
//! sweep tasks spawned the way `ChildTask` backs the resolver's polling loop
//! — against the concrete crates the spec calls for.

pub mod ca;
pub mod secrets;
pub mod tls;
pub mod tokens;

pub use ca::CertificateAuthority;
pub use secrets::SecretsManager;
pub use tls::{client_config, server_config};
pub use tokens::TokenManager;

#[derive(thiserror::Error, Debug)]
pub enum SecurityError {
    #[error("invalid join token")]
    InvalidToken,
    #[error("join token expired")]
    ExpiredToken,
    #[error("join token role mismatch: expected {expected}, got {actual}")]
    TokenRoleMismatch { expected: String, actual: String },
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("crypto error: {0}")]
    Crypto(String),
}

pub type Result<T> = std::result::Result<T, SecurityError>;
