//! Data models for plugin configuration.
//!
//! Two layers live here: the authored document (`PluginsDocument` /
//! `PluginEntry`), which round-trips to disk with placeholders intact, and
//! the resolved, validated form (`PluginConfig`) the engine runs from.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use tendril_types::{EnvSource, EnvVar};
use tendril_util::{InterpolationError, SecretStoreError};
use thiserror::Error;
use url::Url;

use crate::config::settings::{EngineSettings, SettingsDocument};
use crate::config::validation::ValidationError;
use crate::types::TransportKind;

/// The configuration document: every configured plugin plus engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
pub struct PluginsDocument {
    /// Map of plugin names to their entries, in authored order.
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: IndexMap<String, PluginEntry>,

    /// Engine tuning knobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsDocument>,
}

/// Authored configuration for a single plugin.
#[derive(Debug, Default, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PluginEntry {
    /// Command to execute for the local transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments to pass to the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment overrides for the process.
    #[serde(
        default,
        deserialize_with = "deserialize_env_var_set",
        skip_serializing_if = "IndexSet::is_empty"
    )]
    #[schemars(with = "Vec<EnvVar>")]
    pub env: IndexSet<EnvVar>,

    /// Working directory for the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Base URL for the remote transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// HTTP headers sent with every request.
    #[serde(
        default,
        deserialize_with = "deserialize_env_var_set",
        skip_serializing_if = "IndexSet::is_empty"
    )]
    #[schemars(with = "Vec<EnvVar>")]
    pub headers: IndexSet<EnvVar>,

    /// Static credentials turned into one request header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    /// Whether this plugin is disabled.
    #[serde(default)]
    pub disabled: bool,

    /// Optional tags for display and filtering.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl PluginEntry {
    /// Check if this entry is configured for the local transport.
    pub fn is_local(&self) -> bool {
        self.command.is_some()
    }

    /// Check if this entry is configured for the remote transport.
    pub fn is_remote(&self) -> bool {
        self.base_url.is_some()
    }
}

/// Env and header collections accept either `[{key, value}]` or `{key: value}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum EnvVarCollection {
    Sequence(Vec<EnvVar>),
    Map(IndexMap<String, String>),
}

fn deserialize_env_var_set<'de, D>(deserializer: D) -> Result<IndexSet<EnvVar>, D::Error>
where
    D: Deserializer<'de>,
{
    let maybe_collection = Option::<EnvVarCollection>::deserialize(deserializer)?;
    let mut set = IndexSet::new();
    if let Some(collection) = maybe_collection {
        match collection {
            EnvVarCollection::Sequence(items) => {
                for var in items {
                    set.insert(var);
                }
            }
            EnvVarCollection::Map(map) => {
                for (key, value) in map {
                    set.insert(EnvVar::new(key, value, EnvSource::File));
                }
            }
        }
    }
    Ok(set)
}

/// Static credential block for remote plugins.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthConfig {
    /// `bearer` or `basic`.
    pub scheme: String,
    /// Username for basic auth (supports interpolation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password for basic auth (supports interpolation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Bearer token. With basic auth and no username, `"<token>:"` is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Custom header name; defaults to `Authorization`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
}

/// Credentials after interpolation, ready to be applied to requests.
#[derive(Clone)]
pub enum ResolvedAuth {
    /// `Authorization: Bearer <token>`.
    Bearer { token: String },
    /// `Authorization: Basic base64(user:pass)`.
    Basic { username: String, password: Option<String> },
    /// Raw token in a custom header.
    Header { name: String, value: String },
}

impl fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedAuth::Bearer { .. } => f.write_str("Bearer(••••)"),
            ResolvedAuth::Basic { username, .. } => write!(f, "Basic({username}:••••)"),
            ResolvedAuth::Header { name, .. } => write!(f, "Header({name}: ••••)"),
        }
    }
}

/// Resolved, validated configuration of one plugin.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub name: String,
    pub transport: TransportConfig,
    pub disabled: bool,
    pub tags: Vec<String>,
}

impl PluginConfig {
    pub fn transport_kind(&self) -> TransportKind {
        match self.transport {
            TransportConfig::Local { .. } => TransportKind::Local,
            TransportConfig::Remote { .. } => TransportKind::Remote,
        }
    }

    /// Command line or base URL, for display.
    pub fn target(&self) -> String {
        match &self.transport {
            TransportConfig::Local { command, args, .. } => {
                if args.is_empty() {
                    command.clone()
                } else {
                    format!("{} {}", command, args.join(" "))
                }
            }
            TransportConfig::Remote { base_url, .. } => base_url.to_string(),
        }
    }
}

/// How to reach a plugin.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    /// Child process speaking newline-delimited JSON-RPC over stdio.
    Local {
        command: String,
        args: Vec<String>,
        env: IndexSet<EnvVar>,
        cwd: Option<PathBuf>,
    },
    /// HTTP endpoint accepting one JSON-RPC message per POST.
    Remote {
        base_url: Url,
        headers: IndexSet<EnvVar>,
        auth: Option<ResolvedAuth>,
    },
}

/// A plugin entry that failed to resolve during a lenient load.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedPlugin {
    pub name: String,
    /// Redacted error text.
    pub reason: String,
}

/// One configuration generation: the authored document, the plugins that
/// resolved, and the ones that did not.
#[derive(Debug, Clone, Default)]
pub struct PluginSet {
    pub(crate) document: PluginsDocument,
    pub(crate) plugins: IndexMap<String, Arc<PluginConfig>>,
    pub(crate) rejected: Vec<RejectedPlugin>,
    pub(crate) settings: EngineSettings,
}

impl PluginSet {
    /// Build a set directly from resolved configurations.
    pub fn from_configs(configs: impl IntoIterator<Item = PluginConfig>, settings: EngineSettings) -> Self {
        let plugins = configs
            .into_iter()
            .map(|config| (config.name.clone(), Arc::new(config)))
            .collect();
        Self {
            document: PluginsDocument::default(),
            plugins,
            rejected: Vec::new(),
            settings,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<PluginConfig>> {
        self.plugins.get(name)
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Arc<PluginConfig>> {
        self.plugins.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn rejected(&self) -> &[RejectedPlugin] {
        &self.rejected
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// The authored document this set was loaded from.
    pub fn document(&self) -> &PluginsDocument {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut PluginsDocument {
        &mut self.document
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("plugin '{name}': {source}")]
    Validation {
        name: String,
        #[source]
        source: ValidationError,
    },

    #[error("plugin '{name}': {source}")]
    Interpolation {
        name: String,
        #[source]
        source: InterpolationError,
    },

    #[error("secret store error: {0}")]
    Store(#[from] SecretStoreError),

    #[error("invalid settings: {message}")]
    Settings { message: String },
}

impl ConfigError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Plugin the error belongs to, for per-plugin failures.
    pub fn plugin(&self) -> Option<&str> {
        match self {
            Self::Validation { name, .. } | Self::Interpolation { name, .. } => Some(name),
            _ => None,
        }
    }
}
