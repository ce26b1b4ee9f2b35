//! Utility helpers shared across the Tendril crates.

pub mod keystore;
pub mod path_processing;
pub mod text_processing;

pub use keystore::{
    DEFAULT_SERVICE, EnvSecretStore, InterpolationError, KeyringStore, MemorySecretStore, SECRETS_BACKEND_ENV_VAR,
    SecretStore, SecretStoreError, SecretsBackend, interpolate_env, interpolate_string, secret_store_from_env,
    tokenize_env,
};
pub use path_processing::expand_tilde;
pub use text_processing::{DEFAULT_SENSITIVE_KEYS, REDACTED, RedactionRules, is_secret, redact_json, redact_sensitive};
