//! Configuration management for plugins.
//!
//! This module handles parsing, validation, and interpolation of the
//! `~/.config/tendril/plugins.json` document.

mod interpolation;
mod io;
mod model;
mod settings;
mod validation;

pub use interpolation::{resolve_entry, tokenize_document};
pub use io::{CONFIG_PATH_ENV_VAR, ConfigResolver, ResolverSettings, config_schema, default_config_path};
pub use model::{
    AuthConfig, ConfigError, PluginConfig, PluginEntry, PluginSet, PluginsDocument, RejectedPlugin, ResolvedAuth,
    TransportConfig,
};
pub use settings::{AuditSettings, BackoffSettings, EngineSettings, SettingsDocument};
pub use validation::{ValidationError, validate_base_url, validate_entry, validate_plugin_name};
