//! Generated wire types plus the error taxonomy every other Warren crate
//! builds on. Mirrors the role `common::errors` plays in the teacher
//! codebase: a single place that defines what an error *is* before any
//! component starts producing them.

pub mod pb {
    tonic::include_proto!("warren");
}

pub use pb::*;

use std::time::{SystemTime, UNIX_EPOCH};

/// The taxonomy from the error handling design: every fallible call in the
/// core returns one of these, never a bare string.
#[derive(thiserror::Error, Debug, Clone)]
pub enum WarrenError {
    #[error("not leader, try {leader_address:?}")]
    NotLeader { leader_address: Option<String> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Invariant violation inside the core. `fatal` distinguishes a case
    /// that indicates FSM divergence (process must abort, see spec §4.1)
    /// from a merely-unexpected condition that can be surfaced as a 500.
    #[error("internal error: {message}")]
    Internal { message: String, fatal: bool },

    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, WarrenError>;

impl WarrenError {
    pub fn not_leader(leader_address: Option<String>) -> Self {
        Self::NotLeader { leader_address }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            fatal: false,
        }
    }

    /// Logs and aborts the process. Used where Apply or Store detects a
    /// divergence that would otherwise silently corrupt cluster state.
    pub fn fatal(message: impl Into<String>) -> ! {
        let message = message.into();
        tracing::error!(%message, "fatal invariant violation, aborting process");
        std::process::abort();
    }
}

impl From<WarrenError> for tonic::Status {
    fn from(err: WarrenError) -> Self {
        match err {
            WarrenError::NotLeader { leader_address } => {
                let mut status = tonic::Status::unavailable("not leader");
                if let Some(addr) = leader_address {
                    status.metadata_mut().insert(
                        "leader-address",
                        tonic::metadata::MetadataValue::try_from(addr).unwrap(),
                    );
                }
                status
            }
            WarrenError::NotFound(m) => tonic::Status::not_found(m),
            WarrenError::AlreadyExists(m) => tonic::Status::already_exists(m),
            WarrenError::InvalidArgument(m) => tonic::Status::invalid_argument(m),
            WarrenError::PermissionDenied(m) => tonic::Status::permission_denied(m),
            WarrenError::Unauthenticated(m) => tonic::Status::unauthenticated(m),
            WarrenError::Unavailable(m) => tonic::Status::unavailable(m),
            WarrenError::DeadlineExceeded(m) => tonic::Status::deadline_exceeded(m),
            WarrenError::Internal { message, fatal } => {
                if fatal {
                    WarrenError::fatal(message);
                }
                tonic::Status::internal(message)
            }
            WarrenError::Runtime(m) => tonic::Status::unknown(m),
        }
    }
}

/// Generates a stable string id the way the teacher's `new_task_id` does
/// (random value, not derived from content).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_timestamp() -> prost_types::Timestamp {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    prost_types::Timestamp {
        seconds: since_epoch.as_secs() as i64,
        nanos: since_epoch.subsec_nanos() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_round_trips_leader_address() {
        let err = WarrenError::not_leader(Some("10.0.0.1:7000".to_string()));
        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(
            status.metadata().get("leader-address").unwrap().to_str().unwrap(),
            "10.0.0.1:7000"
        );
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }
}
