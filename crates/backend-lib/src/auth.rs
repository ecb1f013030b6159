// ============================
// crates/backend-lib/src/auth.rs
// ============================
//! Connection gatekeeper: bearer-token verification.
//!
//! Token issuance lives outside the core; the server only consumes a
//! `verify(token) -> Identity` capability. `LocalVerifier` is the
//! in-process implementation backed by an issued-token table with TTL.
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics as keys;

/// Token TTL (time to live)
pub const TOKEN_TTL: Duration = Duration::from_secs(60 * 60 * 24); // 24 hours

/// Stable identity established by the gatekeeper for one connection.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

/// Verifies a presented bearer token and resolves it to an identity.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AppError>;
}

struct IssuedToken {
    identity: Identity,
    expires_at: SystemTime,
}

/// In-process token verifier with an issuance side used by tests and
/// single-node deployments.
#[derive(Clone)]
pub struct LocalVerifier {
    tokens: Arc<RwLock<HashMap<String, IssuedToken>>>,
}

impl LocalVerifier {
    pub fn new() -> Self {
        let verifier = LocalVerifier {
            tokens: Arc::new(RwLock::new(HashMap::new())),
        };

        // Periodic sweep of expired tokens
        let sweep = verifier.clone();
        tokio::spawn(async move {
            sweep.cleanup_task().await;
        });

        verifier
    }

    /// Issue a token for a user
    pub fn issue(&self, user_id: &str, display_name: &str) -> String {
        let token = Uuid::new_v4().to_string();
        let mut tokens = self.tokens.write();
        tokens.insert(
            token.clone(),
            IssuedToken {
                identity: Identity {
                    user_id: user_id.to_string(),
                    display_name: display_name.to_string(),
                },
                expires_at: SystemTime::now() + TOKEN_TTL,
            },
        );

        counter!(keys::AUTH_TOKEN_ISSUED).increment(1);
        gauge!(keys::AUTH_TOKEN_ACTIVE).set(tokens.len() as f64);

        token
    }

    /// Revoke a token
    pub fn revoke(&self, token: &str) {
        let mut tokens = self.tokens.write();
        if tokens.remove(token).is_some() {
            counter!(keys::AUTH_TOKEN_REVOKED).increment(1);
            gauge!(keys::AUTH_TOKEN_ACTIVE).set(tokens.len() as f64);
        }
    }

    async fn cleanup_task(&self) {
        let cleanup_interval = Duration::from_secs(60 * 10);

        loop {
            tokio::time::sleep(cleanup_interval).await;

            let mut tokens = self.tokens.write();
            let now = SystemTime::now();
            let before = tokens.len();
            tokens.retain(|_, issued| now < issued.expires_at);
            let removed = before - tokens.len();

            if removed > 0 {
                counter!(keys::AUTH_TOKEN_EXPIRED).increment(removed as u64);
                gauge!(keys::AUTH_TOKEN_ACTIVE).set(tokens.len() as f64);
            }
        }
    }
}

impl Default for LocalVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenVerifier for LocalVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AppError> {
        let tokens = self.tokens.read();
        match tokens.get(token) {
            Some(issued) if SystemTime::now() < issued.expires_at => Ok(issued.identity.clone()),
            Some(_) => Err(AppError::Auth("token expired".to_string())),
            None => Err(AppError::Auth("unknown token".to_string())),
        }
    }
}
