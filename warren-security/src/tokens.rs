//! Join tokens: short-lived, role-scoped credentials handed out by the
//! leader during node registration (spec §4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{Result, SecurityError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRole {
    Manager,
    Worker,
}

impl TokenRole {
    fn as_str(&self) -> &'static str {
        match self {
            TokenRole::Manager => "manager",
            TokenRole::Worker => "worker",
        }
    }
}

struct IssuedToken {
    role: TokenRole,
    expires_at: DateTime<Utc>,
}

/// Holds outstanding join tokens in memory on the leader. Never persisted —
/// a leader failover invalidates every token in flight, which is acceptable
/// per spec: tokens are a bootstrap convenience, not a durability guarantee.
pub struct TokenManager {
    state: Mutex<HashMap<String, IssuedToken>>,
    default_ttl: Duration,
}

impl TokenManager {
    pub fn new(default_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HashMap::new()),
            default_ttl,
        })
    }

    /// Generates 32 bytes of randomness, hex-encoded into a 64-character
    /// token, bound to `role` with the manager's default expiry.
    pub async fn generate(&self, role: TokenRole) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let expires_at = Utc::now() + chrono::Duration::from_std(self.default_ttl).unwrap();
        self.state.lock().await.insert(
            token.clone(),
            IssuedToken {
                role,
                expires_at,
            },
        );
        token
    }

    /// Validates `token` against `expected_role`. Does not consume the
    /// token: spec §4.3 says single-use is not required.
    pub async fn validate(&self, token: &str, expected_role: TokenRole) -> Result<()> {
        let state = self.state.lock().await;
        let issued = state.get(token).ok_or(SecurityError::InvalidToken)?;

        if Utc::now() > issued.expires_at {
            return Err(SecurityError::ExpiredToken);
        }
        if issued.role != expected_role {
            return Err(SecurityError::TokenRoleMismatch {
                expected: expected_role.as_str().to_string(),
                actual: issued.role.as_str().to_string(),
            });
        }
        Ok(())
    }

    pub async fn revoke(&self, token: &str) {
        self.state.lock().await.remove(token);
    }

    /// Validates `token` against either role, returning whichever it was
    /// issued for. Used by certificate issuance, which is gated on "a valid
    /// join token" without caring whether it was a manager or worker token.
    pub async fn validate_any(&self, token: &str) -> Result<TokenRole> {
        let state = self.state.lock().await;
        let issued = state.get(token).ok_or(SecurityError::InvalidToken)?;
        if Utc::now() > issued.expires_at {
            return Err(SecurityError::ExpiredToken);
        }
        Ok(issued.role)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Background sweep: drops expired tokens so the in-memory table doesn't
    /// grow unbounded on a long-lived leader. Run as a cancellable periodic
    /// task (spec §5's background-loop shape), not inline on every lookup.
    pub async fn sweep_expired_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let mut state = self.state.lock().await;
            let before = state.len();
            state.retain(|_, t| t.expires_at > now);
            let removed = before - state.len();
            if removed > 0 {
                debug!(removed, "swept expired join tokens");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generated_token_validates_for_its_role() {
        let mgr = TokenManager::new(Duration::from_secs(3600));
        let token = mgr.generate(TokenRole::Worker).await;
        assert!(mgr.validate(&token, TokenRole::Worker).await.is_ok());
    }

    #[tokio::test]
    async fn role_mismatch_is_rejected() {
        let mgr = TokenManager::new(Duration::from_secs(3600));
        let token = mgr.generate(TokenRole::Worker).await;
        assert!(matches!(
            mgr.validate(&token, TokenRole::Manager).await,
            Err(SecurityError::TokenRoleMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let mgr = TokenManager::new(Duration::from_millis(1));
        let token = mgr.generate(TokenRole::Worker).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            mgr.validate(&token, TokenRole::Worker).await,
            Err(SecurityError::ExpiredToken)
        ));
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let mgr = TokenManager::new(Duration::from_secs(3600));
        assert!(matches!(
            mgr.validate("deadbeef", TokenRole::Worker).await,
            Err(SecurityError::InvalidToken)
        ));
    }
}
