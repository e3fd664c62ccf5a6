//! Authentication Module
//!
//! Username/password authentication against the configured user table.
//! Passwords are stored either in plaintext or as argon2 PHC hashes.

use std::collections::HashMap;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::hooks::{AuthDecision, HookError, HookResult, Hooks};


/// Stored credential for one user
enum Credential {
    Plain(String),
    /// argon2 PHC string
    Hash(String),
}

/// Authentication provider
pub struct AuthProvider {
    /// Whether auth is enabled
    enabled: bool,
    /// Allow connections without a username
    allow_anonymous: bool,
    /// User credentials map (username -> credential)
    users: HashMap<String, Credential>,
}

impl AuthProvider {
    /// Create a new auth provider from configuration
    pub fn new(config: &AuthConfig) -> Self {
        let mut users = HashMap::new();

        for user in &config.users {
            let credential = match (&user.password_hash, &user.password) {
                (Some(hash), _) => Credential::Hash(hash.clone()),
                (None, Some(password)) => Credential::Plain(password.clone()),
                (None, None) => continue,
            };
            users.insert(user.username.clone(), credential);
        }

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
        }
    }

    /// Check if auth is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Verify a password against a stored credential
    ///
    /// Hashes are checked on the blocking pool.
    async fn verify_password(&self, password: &[u8], stored: &Credential) -> HookResult<bool> {
        match stored {
            Credential::Plain(expected) => Ok(password == expected.as_bytes()),
            Credential::Hash(phc) => {
                let phc = phc.clone();
                let password = password.to_vec();
                tokio::task::spawn_blocking(move || verify_hash(&password, &phc))
                    .await
                    .map_err(|e| HookError::Internal(format!("password check failed: {}", e)))?
            }
        }
    }
}

/// Check a password against an argon2 PHC string
///
/// An unparseable stored hash is a backend failure, not a wrong password.
fn verify_hash(password: &[u8], phc: &str) -> HookResult<bool> {
    let parsed = PasswordHash::new(phc)
        .map_err(|e| HookError::Internal(format!("invalid password hash: {}", e)))?;
    Ok(Argon2::default().verify_password(password, &parsed).is_ok())
}

#[async_trait]
impl Hooks for AuthProvider {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<AuthDecision> {
        // If auth is disabled, allow all
        if !self.enabled {
            return Ok(AuthDecision::Accept);
        }

        let Some(username) = username else {
            if self.allow_anonymous {
                return Ok(AuthDecision::Accept);
            }
            debug!(client_id, "anonymous connection refused");
            return Ok(AuthDecision::NotAuthorized);
        };

        let Some(password) = password else {
            debug!(client_id, username, "connection without password refused");
            return Ok(AuthDecision::NotAuthorized);
        };

        let Some(credential) = self.users.get(username) else {
            warn!(client_id, username, "unknown user");
            return Ok(AuthDecision::BadCredentials);
        };

        if self.verify_password(password, credential).await? {
            Ok(AuthDecision::Accept)
        } else {
            warn!(client_id, username, "wrong password");
            Ok(AuthDecision::BadCredentials)
        }
    }
}
