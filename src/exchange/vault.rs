//! In-memory credential vault.

use super::traits::CredentialVault;
use crate::error::{EngineError, Result};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use tracing::info;

/// Holds the session secret in memory and signs venue payloads with
/// HMAC-SHA256. Locking zeroes the secret.
pub struct InMemoryVault {
    api_key: String,
    secret: RwLock<Option<Vec<u8>>>,
}

impl InMemoryVault {
    pub fn new(api_key: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: RwLock::new(Some(secret.into())),
        }
    }

    /// Read credentials from `EQE_API_KEY` / `EQE_API_SECRET`.
    pub fn from_env() -> Option<Self> {
        dotenvy::dotenv().ok();
        let key = std::env::var("EQE_API_KEY").ok()?;
        let secret = std::env::var("EQE_API_SECRET").ok()?;
        Some(Self::new(key, secret.into_bytes()))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl CredentialVault for InMemoryVault {
    fn is_unlocked(&self) -> bool {
        self.secret.read().is_some()
    }

    fn sign(&self, payload: &[u8]) -> Result<String> {
        let guard = self.secret.read();
        let secret = guard
            .as_ref()
            .ok_or_else(|| EngineError::Vault("vault is locked".to_string()))?;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret)
            .map_err(|e| EngineError::Vault(e.to_string()))?;
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn lock(&self) {
        let mut guard = self.secret.write();
        if let Some(secret) = guard.as_mut() {
            secret.iter_mut().for_each(|b| *b = 0);
        }
        *guard = None;
        info!("Credential vault locked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_is_deterministic_hex() {
        let vault = InMemoryVault::new("key", b"secret".to_vec());

        let a = vault.sign(b"order=1").unwrap();
        let b = vault.sign(b"order=1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, vault.sign(b"order=2").unwrap());
    }

    #[test]
    fn test_locked_vault_refuses_to_sign() {
        let vault = InMemoryVault::new("key", b"secret".to_vec());
        assert!(vault.is_unlocked());

        vault.lock();

        assert!(!vault.is_unlocked());
        assert!(matches!(vault.sign(b"x"), Err(EngineError::Vault(_))));
    }
}
