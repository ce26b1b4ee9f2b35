//! `${env:NAME}` / `${secret:NAME}` placeholder resolution and tokenization.

use indexmap::{IndexSet, set::MutableValues};
use once_cell::sync::Lazy;
use regex::Regex;
use tendril_types::{EnvSource, EnvVar};
use thiserror::Error;
use tracing::{debug, warn};

use crate::is_secret;
use crate::keystore::{SecretStore, SecretStoreError};

static PLACEHOLDER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{(env|secret):([^}]*)\}").expect("placeholder regex should compile"));
static PLACEHOLDER_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.+-]+$").expect("placeholder name regex should compile"));

/// Kind of credential reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    Env,
    Secret,
}

/// A placeholder found inside a templated value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub kind: PlaceholderKind,
    pub name: String,
}

/// List the placeholders in `value`, in order of appearance.
pub fn placeholders(value: &str) -> Vec<Placeholder> {
    PLACEHOLDER_REGEX
        .captures_iter(value)
        .map(|captures| Placeholder {
            kind: if &captures[1] == "env" {
                PlaceholderKind::Env
            } else {
                PlaceholderKind::Secret
            },
            name: captures[2].to_string(),
        })
        .collect()
}

/// Whether the value contains at least one placeholder.
pub fn contains_placeholder(value: &str) -> bool {
    PLACEHOLDER_REGEX.is_match(value)
}

/// Resolve every placeholder in `value`. Literal text passes through.
///
/// A missing environment variable or secret is an error; nothing ever
/// resolves to an empty string implicitly.
pub fn interpolate_string(value: &str, store: &dyn SecretStore) -> Result<String, InterpolationError> {
    let mut result = String::with_capacity(value.len());
    let mut last_end = 0;

    for captures in PLACEHOLDER_REGEX.captures_iter(value) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        let name = &captures[2];
        if !PLACEHOLDER_NAME_REGEX.is_match(name) {
            return Err(InterpolationError::InvalidPlaceholder {
                placeholder: whole.as_str().to_string(),
            });
        }

        let resolved = match &captures[1] {
            "env" => {
                let resolved =
                    std::env::var(name).map_err(|_| InterpolationError::MissingEnvVar { name: name.to_string() })?;
                debug!(variable = %name, "interpolated env var -> [REDACTED]");
                resolved
            }
            _ => {
                let resolved = store
                    .get(name)?
                    .ok_or_else(|| InterpolationError::MissingSecret { name: name.to_string() })?;
                debug!(secret = %name, "interpolated secret -> [REDACTED]");
                resolved
            }
        };

        result.push_str(&value[last_end..whole.start()]);
        result.push_str(&resolved);
        last_end = whole.end();
    }

    result.push_str(&value[last_end..]);
    Ok(result)
}

/// Resolve every entry of an env/header set in place, recording the source
/// of each and keeping the authored template untouched.
pub fn interpolate_env(envs: &mut IndexSet<EnvVar>, store: &dyn SecretStore) -> Result<(), InterpolationError> {
    for index in 0..envs.len() {
        let Some(env_var) = envs.get_index_mut2(index) else {
            continue;
        };
        let resolved = interpolate_string(&env_var.value, store)?;
        if env_var.source != EnvSource::Secret {
            env_var.source = determine_env_source(&env_var.value);
        }
        env_var.set_resolved(resolved);
    }
    Ok(())
}

/// Move literal secrets into the store and replace them with
/// `${secret:<plugin>-<KEY>}` so only placeholders reach disk.
///
/// Returns the names written to the store. With a read-only store literal
/// values are left as authored.
pub fn tokenize_env(
    envs: &mut IndexSet<EnvVar>,
    plugin_name: &str,
    store: &dyn SecretStore,
) -> Result<Vec<String>, InterpolationError> {
    let mut stored = Vec::new();
    for index in 0..envs.len() {
        let Some(env_var) = envs.get_index_mut2(index) else {
            continue;
        };
        // Don't trust the incoming source unless it explicitly asks for the store.
        if env_var.source != EnvSource::Secret {
            env_var.source = determine_env_source(&env_var.value);
        }
        if env_var.source != EnvSource::Secret || env_var.value.is_empty() || contains_placeholder(&env_var.value) {
            continue;
        }
        if !store.is_writable() {
            warn!(plugin = %plugin_name, key = %env_var.key, "secret store is read-only; keeping literal value");
            continue;
        }

        let secret_name = format!("{}-{}", plugin_name, env_var.key);
        let literal = std::mem::take(&mut env_var.value);
        store.set(&secret_name, &literal)?;
        if !env_var.is_resolved() {
            env_var.set_resolved(literal);
        }
        env_var.value = format!("${{secret:{}}}", secret_name);
        stored.push(secret_name);
    }
    Ok(stored)
}

/// Determines the source of an env var by its authored value.
pub fn determine_env_source(value: &str) -> EnvSource {
    let found = placeholders(value);
    if found.iter().any(|placeholder| placeholder.kind == PlaceholderKind::Secret) {
        return EnvSource::Secret;
    }
    if !found.is_empty() {
        return EnvSource::Env;
    }
    if is_secret(value) {
        return EnvSource::Secret;
    }
    EnvSource::Raw
}

/// Errors that can occur during interpolation.
#[derive(Debug, Error, Clone)]
pub enum InterpolationError {
    #[error("missing environment variable: {name}")]
    MissingEnvVar { name: String },

    #[error("missing secret: {name}")]
    MissingSecret { name: String },

    #[error("invalid placeholder: {placeholder}")]
    InvalidPlaceholder { placeholder: String },

    #[error(transparent)]
    Store(#[from] SecretStoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{EnvSecretStore, MemorySecretStore};

    fn env_set(entries: &[(&str, &str)]) -> IndexSet<EnvVar> {
        entries
            .iter()
            .map(|(key, value)| EnvVar::new(*key, *value, EnvSource::Raw))
            .collect()
    }

    #[test]
    fn resolves_env_and_secret_placeholders() {
        let store = MemorySecretStore::with_entries([("api.token", "s3cr3t")]);
        temp_env::with_var("INTERP_USER", Some("bob"), || {
            let resolved = interpolate_string("user=${env:INTERP_USER} token=${secret:api.token}!", &store).unwrap();
            assert_eq!(resolved, "user=bob token=s3cr3t!");
        });
    }

    #[test]
    fn literals_pass_through() {
        let store = MemorySecretStore::new();
        assert_eq!(interpolate_string("plain $value {x}", &store).unwrap(), "plain $value {x}");
    }

    #[test]
    fn missing_env_var_is_an_error() {
        let store = MemorySecretStore::new();
        temp_env::with_var("INTERP_MISSING", None::<&str>, || {
            let error = interpolate_string("${env:INTERP_MISSING}", &store).unwrap_err();
            assert!(matches!(error, InterpolationError::MissingEnvVar { ref name } if name == "INTERP_MISSING"));
        });
    }

    #[test]
    fn missing_secret_is_an_error_not_empty() {
        let store = MemorySecretStore::new();
        let error = interpolate_string("Bearer ${secret:absent}", &store).unwrap_err();
        assert!(matches!(error, InterpolationError::MissingSecret { .. }));
    }

    #[test]
    fn malformed_placeholder_is_rejected() {
        let store = MemorySecretStore::new();
        let error = interpolate_string("${env:}", &store).unwrap_err();
        assert!(matches!(error, InterpolationError::InvalidPlaceholder { .. }));
    }

    #[test]
    fn interpolate_env_keeps_template_and_records_source() {
        let store = MemorySecretStore::with_entries([("gh", "ghp_value")]);
        let mut envs = env_set(&[("GITHUB_TOKEN", "${secret:gh}"), ("MODE", "fast")]);
        interpolate_env(&mut envs, &store).unwrap();

        let token = envs.get_index(0).unwrap();
        assert_eq!(token.value, "${secret:gh}");
        assert_eq!(token.effective_value(), "ghp_value");
        assert_eq!(token.source, EnvSource::Secret);

        let mode = envs.get_index(1).unwrap();
        assert_eq!(mode.effective_value(), "fast");
        assert_eq!(mode.source, EnvSource::Raw);
    }

    #[test]
    fn tokenize_moves_literal_secrets_into_store() {
        let store = MemorySecretStore::new();
        let mut envs = IndexSet::new();
        envs.insert(EnvVar::new("API_TOKEN", "literal-value", EnvSource::Secret));
        envs.insert(EnvVar::new("REGION", "eu", EnvSource::Raw));
        envs.insert(EnvVar::new("HOME_DIR", "${env:HOME}", EnvSource::Env));

        let stored = tokenize_env(&mut envs, "github", &store).unwrap();
        assert_eq!(stored, vec!["github-API_TOKEN".to_string()]);
        assert_eq!(envs.get_index(0).unwrap().value, "${secret:github-API_TOKEN}");
        assert_eq!(envs.get_index(0).unwrap().effective_value(), "literal-value");
        assert_eq!(envs.get_index(1).unwrap().value, "eu");
        assert_eq!(envs.get_index(2).unwrap().value, "${env:HOME}");
        assert_eq!(store.get("github-API_TOKEN").unwrap().as_deref(), Some("literal-value"));
    }

    #[test]
    fn tokenize_is_a_no_op_for_read_only_stores() {
        let mut envs = IndexSet::new();
        envs.insert(EnvVar::new("API_TOKEN", "literal-value", EnvSource::Secret));
        let stored = tokenize_env(&mut envs, "github", &EnvSecretStore).unwrap();
        assert!(stored.is_empty());
        assert_eq!(envs.get_index(0).unwrap().value, "literal-value");
    }

    #[test]
    fn determine_env_source_prefers_placeholders() {
        assert_eq!(determine_env_source("${env:A}"), EnvSource::Env);
        assert_eq!(determine_env_source("Bearer ${secret:t}"), EnvSource::Secret);
        assert_eq!(determine_env_source("hello"), EnvSource::Raw);
    }
}
