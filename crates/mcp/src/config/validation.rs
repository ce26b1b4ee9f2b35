//! Configuration validation for plugin entries.

use once_cell::sync::Lazy;
use regex::Regex;
use tendril_types::EnvVar;
use thiserror::Error;
use url::Url;

use crate::config::model::{AuthConfig, PluginEntry};

static NAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9._-]+$").expect("plugin name regex should compile"));
static ENV_KEY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env key regex should compile"));

/// Validate a plugin name.
pub fn validate_plugin_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::InvalidName {
            name: name.to_string(),
            reason: "plugin name cannot be empty".to_string(),
        });
    }

    if !NAME_REGEX.is_match(name) {
        return Err(ValidationError::InvalidName {
            name: name.to_string(),
            reason: "plugin name must contain only lowercase letters, numbers, dots, underscores, and hyphens".to_string(),
        });
    }

    Ok(())
}

/// Validate the shape of a single entry before any interpolation happens.
pub fn validate_entry(entry: &PluginEntry) -> Result<(), ValidationError> {
    match (&entry.command, &entry.base_url) {
        (Some(_), Some(_)) => Err(ValidationError::InvalidTransport {
            reason: "entry sets both 'command' (local) and 'baseUrl' (remote)".to_string(),
        }),
        (None, None) => Err(ValidationError::InvalidTransport {
            reason: "entry must set either 'command' (local) or 'baseUrl' (remote)".to_string(),
        }),
        (Some(command), None) => validate_local_entry(command, entry),
        (None, Some(base_url)) => validate_remote_entry(base_url, entry).map(|_| ()),
    }
}

fn validate_local_entry(command: &str, entry: &PluginEntry) -> Result<(), ValidationError> {
    if command.trim().is_empty() {
        return Err(ValidationError::MissingRequiredField {
            field: "command".to_string(),
            transport: "local".to_string(),
        });
    }

    if !entry.headers.is_empty() || entry.auth.is_some() {
        return Err(ValidationError::InvalidTransport {
            reason: "'headers' and 'auth' only apply to remote plugins".to_string(),
        });
    }

    for EnvVar { key, .. } in &entry.env {
        validate_env_key(key)?;
    }

    Ok(())
}

/// Parse and check a remote base URL.
pub fn validate_base_url(raw: &str) -> Result<Url, ValidationError> {
    if raw.trim().is_empty() {
        return Err(ValidationError::MissingRequiredField {
            field: "baseUrl".to_string(),
            transport: "remote".to_string(),
        });
    }

    let url = Url::parse(raw.trim()).map_err(|error| ValidationError::InvalidUrl {
        url: raw.to_string(),
        reason: error.to_string(),
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ValidationError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}' (expected http/https)", url.scheme()),
        });
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(ValidationError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(url)
}

fn validate_remote_entry(base_url: &str, entry: &PluginEntry) -> Result<Url, ValidationError> {
    let url = validate_base_url(base_url)?;

    if !entry.env.is_empty() || entry.cwd.is_some() || !entry.args.is_empty() {
        return Err(ValidationError::InvalidTransport {
            reason: "'args', 'env' and 'cwd' only apply to local plugins".to_string(),
        });
    }

    for EnvVar { key, .. } in &entry.headers {
        validate_header_name(key)?;
    }

    if let Some(auth) = &entry.auth {
        validate_auth(auth)?;
    }

    Ok(url)
}

fn validate_env_key(key: &str) -> Result<(), ValidationError> {
    if !ENV_KEY_REGEX.is_match(key) {
        return Err(ValidationError::InvalidEnvKey {
            key: key.to_string(),
            reason: "keys must start with a letter or underscore, followed by letters, digits, or underscores".to_string(),
        });
    }

    Ok(())
}

/// Validate an HTTP header name.
fn validate_header_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::InvalidHeaderName {
            name: name.to_string(),
            reason: "header name cannot be empty".to_string(),
        });
    }

    if name.chars().any(|c| c.is_control() || c.is_whitespace() || c == ':') {
        return Err(ValidationError::InvalidHeaderName {
            name: name.to_string(),
            reason: "header name cannot contain whitespace, ':' or control characters".to_string(),
        });
    }

    Ok(())
}

fn validate_auth(auth: &AuthConfig) -> Result<(), ValidationError> {
    match auth.scheme.to_ascii_lowercase().as_str() {
        "bearer" => {
            if auth.token.is_none() {
                return Err(ValidationError::InvalidAuth {
                    reason: "bearer auth requires 'token'".to_string(),
                });
            }
        }
        "basic" => {
            if auth.username.is_none() && auth.token.is_none() {
                return Err(ValidationError::InvalidAuth {
                    reason: "basic auth requires 'username' (and optionally 'password') or 'token'".to_string(),
                });
            }
        }
        other => {
            return Err(ValidationError::InvalidAuth {
                reason: format!("unsupported scheme '{}' (expected bearer or basic)", other),
            });
        }
    }

    if let Some(header_name) = &auth.header_name {
        validate_header_name(header_name)?;
    }

    Ok(())
}

/// Errors that can occur during validation.
#[derive(Debug, Error, Clone)]
pub enum ValidationError {
    #[error("invalid plugin name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid transport configuration: {reason}")]
    InvalidTransport { reason: String },

    #[error("missing required field '{field}' for {transport} transport")]
    MissingRequiredField { field: String, transport: String },

    #[error("invalid baseUrl '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid environment variable key '{key}': {reason}")]
    InvalidEnvKey { key: String, reason: String },

    #[error("invalid HTTP header name '{name}': {reason}")]
    InvalidHeaderName { name: String, reason: String },

    #[error("invalid auth configuration: {reason}")]
    InvalidAuth { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tendril_types::EnvSource;

    fn local(command: &str) -> PluginEntry {
        PluginEntry {
            command: Some(command.to_string()),
            ..Default::default()
        }
    }

    fn remote(url: &str) -> PluginEntry {
        PluginEntry {
            base_url: Some(url.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_plugin_name() {
        assert!(validate_plugin_name("github").is_ok());
        assert!(validate_plugin_name("my-server").is_ok());
        assert!(validate_plugin_name("server_1").is_ok());
        assert!(validate_plugin_name("test.server").is_ok());

        assert!(validate_plugin_name("").is_err());
        assert!(validate_plugin_name("GitHub").is_err());
        assert!(validate_plugin_name("my server").is_err());
        assert!(validate_plugin_name("server@example").is_err());
    }

    #[test]
    fn local_entry_requires_command() {
        assert!(validate_entry(&local("node")).is_ok());
        assert!(matches!(
            validate_entry(&local("  ")),
            Err(ValidationError::MissingRequiredField { .. })
        ));
    }

    #[test]
    fn entry_needs_exactly_one_transport() {
        assert!(matches!(
            validate_entry(&PluginEntry::default()),
            Err(ValidationError::InvalidTransport { .. })
        ));

        let mut both = local("node");
        both.base_url = Some("https://example.com".to_string());
        assert!(matches!(validate_entry(&both), Err(ValidationError::InvalidTransport { .. })));
    }

    #[test]
    fn remote_entry_requires_well_formed_url() {
        assert!(validate_entry(&remote("https://example.com/mcp")).is_ok());
        assert!(matches!(validate_entry(&remote("not a url")), Err(ValidationError::InvalidUrl { .. })));
        assert!(matches!(validate_entry(&remote("ws://example.com")), Err(ValidationError::InvalidUrl { .. })));
        assert!(matches!(validate_entry(&remote("")), Err(ValidationError::MissingRequiredField { .. })));
    }

    #[test]
    fn rejects_bad_env_keys_and_header_names() {
        let mut entry = local("node");
        entry.env.insert(EnvVar::new("123API_KEY", "x", EnvSource::Raw));
        assert!(matches!(validate_entry(&entry), Err(ValidationError::InvalidEnvKey { .. })));

        let mut entry = remote("https://example.com");
        entry.headers.insert(EnvVar::new("Bad Header", "x", EnvSource::Raw));
        assert!(matches!(validate_entry(&entry), Err(ValidationError::InvalidHeaderName { .. })));
    }

    #[test]
    fn auth_scheme_must_be_known() {
        let mut entry = remote("https://example.com");
        entry.auth = Some(AuthConfig {
            scheme: "oauth".to_string(),
            ..Default::default()
        });
        assert!(matches!(validate_entry(&entry), Err(ValidationError::InvalidAuth { .. })));

        entry.auth = Some(AuthConfig {
            scheme: "Bearer".to_string(),
            token: Some("${secret:api.token}".to_string()),
            ..Default::default()
        });
        assert!(validate_entry(&entry).is_ok());
    }
}
