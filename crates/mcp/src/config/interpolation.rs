//! Resolution of authored entries into runnable plugin configurations.

use indexmap::IndexSet;
use tendril_types::EnvVar;
use tendril_util::{InterpolationError, SecretStore, interpolate_env, interpolate_string, tokenize_env};
use tracing::debug;

use crate::config::model::{AuthConfig, ConfigError, PluginConfig, PluginEntry, PluginsDocument, ResolvedAuth, TransportConfig};
use crate::config::validation::{validate_base_url, validate_entry, validate_plugin_name};

const AUTHORIZATION: &str = "Authorization";

/// Validate and interpolate one entry.
///
/// The entry itself is left untouched; resolved values only exist on the
/// returned configuration.
pub fn resolve_entry(name: &str, entry: &PluginEntry, store: &dyn SecretStore) -> Result<PluginConfig, ConfigError> {
    let validation = |source| ConfigError::Validation {
        name: name.to_string(),
        source,
    };
    let interpolation = |source| ConfigError::Interpolation {
        name: name.to_string(),
        source,
    };

    validate_plugin_name(name).map_err(validation)?;
    validate_entry(entry).map_err(validation)?;

    let transport = match (&entry.command, &entry.base_url) {
        (Some(command), _) => {
            let mut env = entry.env.clone();
            interpolate_env(&mut env, store).map_err(interpolation)?;
            TransportConfig::Local {
                command: command.trim().to_string(),
                args: entry.args.clone(),
                env,
                cwd: entry.cwd.clone(),
            }
        }
        (None, Some(base_url)) => {
            let base_url = validate_base_url(base_url).map_err(validation)?;
            let mut headers = entry.headers.clone();
            interpolate_env(&mut headers, store).map_err(interpolation)?;
            let auth = entry
                .auth
                .as_ref()
                .map(|auth| resolve_auth(auth, store))
                .transpose()
                .map_err(interpolation)?;
            TransportConfig::Remote {
                base_url,
                headers,
                auth,
            }
        }
        // validate_entry guarantees one transport.
        (None, None) => {
            return Err(validation(crate::config::ValidationError::InvalidTransport {
                reason: "entry must set either 'command' or 'baseUrl'".to_string(),
            }));
        }
    };

    debug!(plugin = %name, "resolved plugin configuration");

    Ok(PluginConfig {
        name: name.to_string(),
        transport,
        disabled: entry.disabled,
        tags: entry.tags.clone(),
    })
}

fn resolve_auth(auth: &AuthConfig, store: &dyn SecretStore) -> Result<ResolvedAuth, InterpolationError> {
    let resolve = |value: &Option<String>| -> Result<Option<String>, InterpolationError> {
        value.as_deref().map(|value| interpolate_string(value, store)).transpose()
    };

    let token = resolve(&auth.token)?;
    let username = resolve(&auth.username)?;
    let password = resolve(&auth.password)?;
    let custom_header = auth
        .header_name
        .as_deref()
        .filter(|name| !name.eq_ignore_ascii_case(AUTHORIZATION));

    if auth.scheme.eq_ignore_ascii_case("basic") {
        return Ok(match username {
            Some(username) => ResolvedAuth::Basic { username, password },
            None => ResolvedAuth::Basic {
                username: token.unwrap_or_default(),
                password: None,
            },
        });
    }

    let token = token.unwrap_or_default();
    Ok(match custom_header {
        Some(name) => ResolvedAuth::Header {
            name: name.to_string(),
            value: token,
        },
        None => ResolvedAuth::Bearer { token },
    })
}

/// Move literal secrets of every entry into the store, leaving placeholders.
///
/// Returns the secret names that were written.
pub fn tokenize_document(document: &mut PluginsDocument, store: &dyn SecretStore) -> Result<Vec<String>, ConfigError> {
    let mut stored = Vec::new();
    for (name, entry) in document.mcp_servers.iter_mut() {
        stored.extend(tokenize_collection(&mut entry.env, name, store)?);
        stored.extend(tokenize_collection(&mut entry.headers, name, store)?);
    }
    Ok(stored)
}

fn tokenize_collection(
    collection: &mut IndexSet<EnvVar>,
    name: &str,
    store: &dyn SecretStore,
) -> Result<Vec<String>, ConfigError> {
    tokenize_env(collection, name, store).map_err(|source| ConfigError::Interpolation {
        name: name.to_string(),
        source,
    })
}
