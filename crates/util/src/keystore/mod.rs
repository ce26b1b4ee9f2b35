//! Secret storage backends.
//!
//! `${secret:NAME}` placeholders resolve through a [`SecretStore`]. The OS
//! keychain is the default; CI and headless hosts can switch to reading
//! secrets from the process environment with `TENDRIL_SECRETS_BACKEND=env`.

mod interpolation;

pub use interpolation::{
    InterpolationError, Placeholder, PlaceholderKind, contains_placeholder, determine_env_source, interpolate_env,
    interpolate_string, placeholders, tokenize_env,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

/// Default keychain service name.
pub const DEFAULT_SERVICE: &str = "tendril";
/// Environment variable used to select the secret resolution backend.
pub const SECRETS_BACKEND_ENV_VAR: &str = "TENDRIL_SECRETS_BACKEND";

/// Secret resolution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretsBackend {
    /// OS keychain via `keyring`.
    Keychain,
    /// Process environment variable `NAME`.
    Environment,
    /// In-process map.
    Memory,
}

impl SecretsBackend {
    fn from_env_var(raw: Option<String>) -> Self {
        match raw.unwrap_or_default().trim().to_ascii_lowercase().as_str() {
            "env" | "environment" => Self::Environment,
            _ => Self::Keychain,
        }
    }
}

/// Determine the currently configured secrets backend.
pub fn secrets_backend() -> SecretsBackend {
    SecretsBackend::from_env_var(std::env::var(SECRETS_BACKEND_ENV_VAR).ok())
}

/// Build the store selected by [`SECRETS_BACKEND_ENV_VAR`].
pub fn secret_store_from_env(service: &str) -> Arc<dyn SecretStore> {
    match secrets_backend() {
        SecretsBackend::Environment => Arc::new(EnvSecretStore),
        _ => Arc::new(KeyringStore::new(service)),
    }
}

/// Read/write access to named secrets.
///
/// `get` returns `Ok(None)` when the secret simply does not exist; errors are
/// reserved for backend failures.
pub trait SecretStore: Send + Sync + fmt::Debug {
    fn get(&self, name: &str) -> Result<Option<String>, SecretStoreError>;

    fn set(&self, name: &str, value: &str) -> Result<(), SecretStoreError>;

    fn delete(&self, name: &str) -> Result<(), SecretStoreError>;

    fn backend(&self) -> SecretsBackend;

    /// Whether `set` is supported.
    fn is_writable(&self) -> bool {
        true
    }
}

/// Keychain-backed store scoped to one service name.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry, SecretStoreError> {
        keyring::Entry::new(&self.service, name).map_err(|error| SecretStoreError::backend(name, error))
    }
}

impl SecretStore for KeyringStore {
    fn get(&self, name: &str) -> Result<Option<String>, SecretStoreError> {
        match self.entry(name)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(SecretStoreError::backend(name, error)),
        }
    }

    fn set(&self, name: &str, value: &str) -> Result<(), SecretStoreError> {
        self.entry(name)?
            .set_password(value)
            .map_err(|error| SecretStoreError::backend(name, error))?;
        debug!(service = %self.service, secret = %name, "stored secret in keychain");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        match self.entry(name)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                debug!(service = %self.service, secret = %name, "removed secret from keychain");
                Ok(())
            }
            Err(error) => Err(SecretStoreError::backend(name, error)),
        }
    }

    fn backend(&self) -> SecretsBackend {
        SecretsBackend::Keychain
    }
}

/// Resolves secrets from the process environment. Read-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get(&self, name: &str) -> Result<Option<String>, SecretStoreError> {
        Ok(std::env::var(name).ok())
    }

    fn set(&self, name: &str, _value: &str) -> Result<(), SecretStoreError> {
        Err(SecretStoreError::ReadOnly { name: name.to_string() })
    }

    fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        Err(SecretStoreError::ReadOnly { name: name.to_string() })
    }

    fn backend(&self) -> SecretsBackend {
        SecretsBackend::Environment
    }

    fn is_writable(&self) -> bool {
        false
    }
}

/// In-memory store for fixtures and embedding hosts.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with entries.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = entries.into_iter().map(|(key, value)| (key.into(), value.into())).collect();
        Self { entries: Mutex::new(map) }
    }

    /// Names currently stored.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for MemorySecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySecretStore").field("names", &self.names()).finish()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Result<Option<String>, SecretStoreError> {
        Ok(self.lock().get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<(), SecretStoreError> {
        self.lock().insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        self.lock().remove(name);
        Ok(())
    }

    fn backend(&self) -> SecretsBackend {
        SecretsBackend::Memory
    }
}

/// Errors raised by a secret store backend.
#[derive(Debug, Error, Clone)]
pub enum SecretStoreError {
    #[error("secret store error for {name}: {reason}")]
    Backend { name: String, reason: String },

    #[error("secret store is read-only; cannot write {name}")]
    ReadOnly { name: String },
}

impl SecretStoreError {
    fn backend(name: &str, error: impl fmt::Display) -> Self {
        Self::Backend {
            name: name.to_string(),
            reason: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_backend_defaults_to_keychain_when_env_var_is_missing() {
        temp_env::with_var(SECRETS_BACKEND_ENV_VAR, None::<&str>, || {
            assert_eq!(secrets_backend(), SecretsBackend::Keychain);
        });
    }

    #[test]
    fn secrets_backend_uses_environment_when_configured() {
        temp_env::with_var(SECRETS_BACKEND_ENV_VAR, Some("env"), || {
            assert_eq!(secrets_backend(), SecretsBackend::Environment);
            assert_eq!(secret_store_from_env(DEFAULT_SERVICE).backend(), SecretsBackend::Environment);
        });
    }

    #[test]
    fn env_store_reads_process_environment() {
        temp_env::with_var("KEYSTORE_TEST_SECRET", Some("test-secret-value"), || {
            let store = EnvSecretStore;
            assert_eq!(store.get("KEYSTORE_TEST_SECRET").unwrap().as_deref(), Some("test-secret-value"));
            assert!(store.set("KEYSTORE_TEST_SECRET", "x").is_err());
            assert!(!store.is_writable());
        });
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemorySecretStore::with_entries([("a", "1")]);
        store.set("b", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.names(), vec!["a".to_string(), "b".to_string()]);
        store.delete("a").unwrap();
        assert!(store.get("a").unwrap().is_none());
        assert!(!format!("{:?}", store).contains('2'));
    }
}
