//! Connection authentication for the relay
//!
//! The booking service issues each participant a token bound to their
//! identity. The relay only needs to check that binding; it never sees user
//! records.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::config::{AuthMode, RelayAuthConfig};
use crate::error::{AppError, Result};

/// Verifies `authenticate{identity, token}` messages
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, identity: &str, token: &str) -> Result<()>;
}

/// Accepts any non-empty identity/token pair. Development only.
pub struct OpenAuthenticator;

#[async_trait]
impl Authenticator for OpenAuthenticator {
    async fn verify(&self, identity: &str, token: &str) -> Result<()> {
        if identity.trim().is_empty() || token.is_empty() {
            return Err(AppError::AuthError("Missing identity or token".to_string()));
        }
        Ok(())
    }
}

/// Tokens are `base64url(sha256(secret ":" identity))`
pub struct SharedSecretAuthenticator {
    secret: String,
}

impl SharedSecretAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Token the booking service hands to `identity`
    pub fn token_for(&self, identity: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(identity.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

#[async_trait]
impl Authenticator for SharedSecretAuthenticator {
    async fn verify(&self, identity: &str, token: &str) -> Result<()> {
        if identity.trim().is_empty() {
            return Err(AppError::AuthError("Missing identity".to_string()));
        }
        let expected = self.token_for(identity);
        if bool::from(expected.as_bytes().ct_eq(token.as_bytes())) {
            Ok(())
        } else {
            Err(AppError::AuthError("Invalid token".to_string()))
        }
    }
}

/// Build the authenticator selected in config
pub fn build_authenticator(config: &RelayAuthConfig) -> Result<Arc<dyn Authenticator>> {
    match config.mode {
        AuthMode::Open => {
            tracing::warn!("Relay authentication is open; any token is accepted");
            Ok(Arc::new(OpenAuthenticator))
        }
        AuthMode::SharedSecret => {
            let secret = config
                .shared_secret
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    AppError::Config("relay.auth.shared_secret is required".to_string())
                })?;
            Ok(Arc::new(SharedSecretAuthenticator::new(secret)))
        }
    }
}
