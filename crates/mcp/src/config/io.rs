//! Loading and saving the plugin configuration document.

use std::env;
use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dirs_next::config_dir;
use serde_json::Value;
use tendril_util::{DEFAULT_SERVICE, SecretStore, expand_tilde, redact_sensitive, secret_store_from_env};
use tracing::{debug, warn};

use crate::config::interpolation::{resolve_entry, tokenize_document};
use crate::config::model::{ConfigError, PluginSet, PluginsDocument, RejectedPlugin};
use crate::config::settings::EngineSettings;

/// Environment variable overriding the configuration path.
pub const CONFIG_PATH_ENV_VAR: &str = "TENDRIL_PLUGINS_CONFIG";

/// Returns the default path for the plugin configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV_VAR)
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tendril")
        .join("plugins.json")
}

/// JSON Schema of the configuration document.
pub fn config_schema() -> Value {
    schemars::schema_for!(PluginsDocument).to_value()
}

/// Where the resolver reads from and which keychain service it uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverSettings {
    pub config_path: PathBuf,
    pub secret_service: String,
}

impl ResolverSettings {
    /// Defaults taken from the process environment.
    pub fn from_environment() -> Self {
        Self {
            config_path: default_config_path(),
            secret_service: DEFAULT_SERVICE.to_string(),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
            secret_service: DEFAULT_SERVICE.to_string(),
        }
    }
}

/// Reads the configuration document and resolves it against a secret store.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    settings: ResolverSettings,
    store: Arc<dyn SecretStore>,
}

impl ConfigResolver {
    pub fn new(settings: ResolverSettings, store: Arc<dyn SecretStore>) -> Self {
        Self { settings, store }
    }

    /// Resolver for the default path, backed by the store selected through
    /// `TENDRIL_SECRETS_BACKEND`.
    pub fn from_environment() -> Self {
        let settings = ResolverSettings::from_environment();
        let store = secret_store_from_env(&settings.secret_service);
        Self::new(settings, store)
    }

    pub fn path(&self) -> &Path {
        &self.settings.config_path
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    /// Load and resolve every plugin, failing on the first problem.
    pub fn load(&self) -> Result<PluginSet, ConfigError> {
        let document = self.read_document()?;
        self.resolve(document, true)
    }

    /// Load the document, collecting per-plugin failures in
    /// [`PluginSet::rejected`] instead of failing the whole load.
    pub fn load_lenient(&self) -> Result<PluginSet, ConfigError> {
        let document = self.read_document()?;
        self.resolve(document, false)
    }

    /// Parse and resolve a document held in memory.
    pub fn parse(&self, content: &str, strict: bool) -> Result<PluginSet, ConfigError> {
        let document: PluginsDocument = serde_json::from_str(content)?;
        self.resolve(document, strict)
    }

    /// Write the set's document back to disk in placeholder form.
    ///
    /// Returns the secret names stored while tokenizing.
    pub fn save(&self, set: &mut PluginSet) -> Result<Vec<String>, ConfigError> {
        self.save_document(&mut set.document)
    }

    /// Tokenize and write a document.
    pub fn save_document(&self, document: &mut PluginsDocument) -> Result<Vec<String>, ConfigError> {
        let path = self.path();
        if let Some(parent_directory) = path.parent()
            && !parent_directory.as_os_str().is_empty()
        {
            create_dir_all(parent_directory).map_err(|error| ConfigError::io(parent_directory, error))?;
        }

        let stored = tokenize_document(document, self.store.as_ref())?;
        let content = serde_json::to_string_pretty(document)?;
        fs::write(path, content).map_err(|error| ConfigError::io(path, error))?;
        debug!(path = %path.display(), stored = stored.len(), "saved plugin configuration");
        Ok(stored)
    }

    fn read_document(&self) -> Result<PluginsDocument, ConfigError> {
        let path = self.path();
        if !path.exists() {
            debug!(path = %path.display(), "no plugin configuration found; using an empty set");
            return Ok(PluginsDocument::default());
        }

        let content = fs::read_to_string(path).map_err(|error| ConfigError::io(path, error))?;
        Ok(serde_json::from_str(&content)?)
    }

    fn resolve(&self, document: PluginsDocument, strict: bool) -> Result<PluginSet, ConfigError> {
        let settings = EngineSettings::from_document(document.settings.as_ref())?;
        let mut set = PluginSet {
            settings,
            ..Default::default()
        };

        for (name, entry) in &document.mcp_servers {
            match resolve_entry(name, entry, self.store.as_ref()) {
                Ok(config) => {
                    set.plugins.insert(name.clone(), Arc::new(config));
                }
                Err(error) if strict => return Err(error),
                Err(error) => {
                    let reason = redact_sensitive(&error.to_string());
                    warn!(plugin = %name, error = %reason, "rejected plugin configuration");
                    set.rejected.push(RejectedPlugin {
                        name: name.clone(),
                        reason,
                    });
                }
            }
        }

        set.document = document;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tendril_util::MemorySecretStore;

    use crate::config::TransportConfig;

    const DOCUMENT: &str = r#"{
      "mcpServers": {
        "github": {
          "command": "node",
          "args": ["server.js"],
          "env": [
            { "key": "GITHUB_TOKEN", "value": "${secret:github-GITHUB_TOKEN}" },
            { "key": "MODE", "value": "fast" }
          ]
        },
        "remote": {
          "baseUrl": "http://localhost:9/rpc",
          "headers": { "X-Api-Key": "${secret:remote.key}" }
        }
      },
      "settings": { "healthIntervalMs": 1000 }
    }"#;

    fn resolver(dir: &TempDir, store: MemorySecretStore) -> ConfigResolver {
        ConfigResolver::new(ResolverSettings::with_path(dir.path().join("plugins.json")), Arc::new(store))
    }

    fn seeded_store() -> MemorySecretStore {
        MemorySecretStore::with_entries([("github-GITHUB_TOKEN", "ghp_live"), ("remote.key", "k-123")])
    }

    #[test]
    fn default_path_honors_environment_override() {
        let override_path = "~/custom/tendril/plugins.json";
        temp_env::with_var(CONFIG_PATH_ENV_VAR, Some(override_path), || {
            assert_eq!(default_config_path(), expand_tilde(override_path));
        });
    }

    #[test]
    fn missing_file_yields_empty_set() {
        let dir = TempDir::new().unwrap();
        let set = resolver(&dir, MemorySecretStore::new()).load().unwrap();
        assert!(set.is_empty());
        assert!(set.rejected().is_empty());
    }

    #[test]
    fn load_resolves_plugins_and_settings() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("plugins.json"), DOCUMENT).unwrap();

        let set = resolver(&dir, seeded_store()).load().unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["github", "remote"]);
        assert_eq!(set.settings().health_interval, std::time::Duration::from_secs(1));

        let github = set.get("github").unwrap();
        let TransportConfig::Local { env, .. } = &github.transport else {
            panic!("expected local transport");
        };
        assert_eq!(env.first().unwrap().effective_value(), "ghp_live");
    }

    #[test]
    fn strict_load_fails_while_lenient_load_rejects_one_plugin() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("plugins.json"), DOCUMENT).unwrap();
        let store = MemorySecretStore::with_entries([("github-GITHUB_TOKEN", "ghp_live")]);
        let resolver = resolver(&dir, store);

        let error = resolver.load().unwrap_err();
        assert_eq!(error.plugin(), Some("remote"));

        let set = resolver.load_lenient().unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.rejected().len(), 1);
        assert_eq!(set.rejected()[0].name, "remote");
        assert!(set.rejected()[0].reason.contains("missing secret"));
    }

    #[test]
    fn malformed_json_is_fatal_even_when_lenient() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("plugins.json"), "{ not json").unwrap();
        assert!(matches!(
            resolver(&dir, MemorySecretStore::new()).load_lenient(),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn save_then_load_keeps_placeholders() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plugins.json");
        fs::write(&path, DOCUMENT).unwrap();
        let resolver = resolver(&dir, seeded_store());

        let mut set = resolver.load().unwrap();
        resolver.save(&mut set).unwrap();
        let first = fs::read_to_string(&path).unwrap();
        assert!(first.contains("${secret:github-GITHUB_TOKEN}"));
        assert!(!first.contains("ghp_live"));
        assert!(!first.contains("k-123"));

        let mut reloaded = resolver.load().unwrap();
        resolver.save(&mut reloaded).unwrap();
        let second = fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn save_moves_literal_secret_into_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plugins.json");
        fs::write(
            &path,
            r#"{"mcpServers": {"svc": {"command": "svc", "env": [{"key": "API_KEY", "value": "hunter2", "source": "secret"}]}}}"#,
        )
        .unwrap();
        let store = Arc::new(MemorySecretStore::new());
        let resolver = ConfigResolver::new(ResolverSettings::with_path(&path), store.clone());

        let mut set = resolver.load().unwrap();
        let stored = resolver.save(&mut set).unwrap();
        assert_eq!(stored, vec!["svc-API_KEY".to_string()]);
        assert_eq!(store.get("svc-API_KEY").unwrap().as_deref(), Some("hunter2"));

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("${secret:svc-API_KEY}"));
        assert!(!written.contains("hunter2"));
    }

    #[test]
    fn schema_describes_document() {
        let schema = config_schema();
        let rendered = schema.to_string();
        assert!(rendered.contains("mcpServers"));
        assert!(rendered.contains("baseUrl"));
    }
}
