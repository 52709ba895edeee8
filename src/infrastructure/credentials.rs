//! Venue API credentials
//!
//! Secrets are wrapped in `Zeroizing` so key material is wiped from memory
//! when dropped, and never appears in Debug output or logs.

use std::env;
use tracing::warn;
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("Credential validation failed: {0}")]
    ValidationFailed(String),
}

/// API key pair for a signed venue gateway.
pub struct ApiCredentials {
    key: String,
    secret: Zeroizing<String>,
}

impl ApiCredentials {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Result<Self, CredentialError> {
        let key = key.into();
        let secret = secret.into();
        if key.trim().is_empty() {
            return Err(CredentialError::ValidationFailed(
                "API key must not be empty".to_string(),
            ));
        }
        if secret.trim().is_empty() {
            return Err(CredentialError::ValidationFailed(
                "API secret must not be empty".to_string(),
            ));
        }
        Ok(Self {
            key,
            secret: Zeroizing::new(secret),
        })
    }

    /// Load `<PREFIX>_API_KEY` / `<PREFIX>_API_SECRET` from the environment.
    pub fn from_env(prefix: &str) -> Result<Self, CredentialError> {
        let key_var = format!("{}_API_KEY", prefix);
        let secret_var = format!("{}_API_SECRET", prefix);

        let key = env::var(&key_var).map_err(|_| CredentialError::EnvVarNotSet(key_var))?;
        let secret = match env::var(&secret_var) {
            Ok(secret) => secret,
            Err(_) => {
                warn!("{} is set but {} is missing", prefix, secret_var);
                return Err(CredentialError::EnvVarNotSet(secret_var));
            }
        };

        Self::new(key, secret)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_key() {
        assert!(ApiCredentials::new("", "secret").is_err());
        assert!(ApiCredentials::new("key", " ").is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let credentials = ApiCredentials::new("key-id", "very-secret").unwrap();
        let debug = format!("{:?}", credentials);
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_accessors() {
        let credentials = ApiCredentials::new("key-id", "shhh").unwrap();
        assert_eq!(credentials.key(), "key-id");
        assert_eq!(credentials.secret(), "shhh");
    }
}
