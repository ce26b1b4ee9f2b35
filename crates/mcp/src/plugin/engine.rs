//! Plugin engine implementation.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tendril_util::{RedactionRules, redact_sensitive};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::client::{ClientManager, DefaultTransportFactory, HealthMonitor, ManagerDeps, TransportFactory};
use crate::config::{ConfigError, ConfigResolver, EngineSettings, PluginSet, RejectedPlugin, TransportConfig};
use crate::logging::{AuditLogger, AuditTrail, LogManager};
use crate::plugin::{LifecycleCoordinator, LifecycleEvent};
use crate::provider::{ProviderBridge, ProviderContract, ProviderError, ValueProvider, split_provider_id};
use crate::types::{
    AuthError, HealthRecord, InvokeError, LogEntry, LogError, PluginDetail, PluginStatus, ToolError, ToolOutput,
    TransportError,
};

/// Log lines included in a [`PluginDetail`].
const DETAIL_LOG_LINES: usize = 100;

/// Entry point for hosts: lifecycle, inspection, invocation and providers.
pub struct PluginEngine {
    /// Supervises plugin connections.
    clients: ClientManager,

    /// Per-plugin log buffers.
    logs: Arc<LogManager>,

    health: HealthMonitor,

    lifecycle: Arc<LifecycleCoordinator>,

    providers: Arc<ProviderBridge>,

    /// Plugins the last load could not resolve.
    rejected: RwLock<Vec<RejectedPlugin>>,
}

impl PluginEngine {
    /// Create an engine over `plugins`. Nothing is started. Must be called
    /// inside a tokio runtime.
    pub fn new(plugins: PluginSet, settings: EngineSettings) -> Self {
        Self::with_factory(plugins, settings, Arc::new(DefaultTransportFactory))
    }

    /// Load the resolver's document leniently and build an engine from it.
    pub fn from_resolver(resolver: &ConfigResolver) -> Result<Self, EngineError> {
        let plugins = resolver.load_lenient()?;
        let settings = plugins.settings().clone();
        Ok(Self::new(plugins, settings))
    }

    /// Create an engine whose transports come from `factory`.
    pub fn with_factory(plugins: PluginSet, settings: EngineSettings, factory: Arc<dyn TransportFactory>) -> Self {
        let rules = RedactionRules::with_extra_keys(&settings.redact_keys).unwrap_or_else(|error| {
            warn!(error = %error, "ignoring invalid redact keys");
            RedactionRules::default()
        });
        let rules = Arc::new(rules);
        let logs = Arc::new(LogManager::with_rules(settings.log_capacity, Arc::clone(&rules)));
        let audit = AuditTrail::spawn(AuditLogger::from_settings(&settings.audit), Arc::clone(&rules));
        let lifecycle = Arc::new(LifecycleCoordinator::new(audit, Arc::clone(&logs), Arc::clone(&rules)));
        let health = HealthMonitor::new();
        let providers = Arc::new(ProviderBridge::new());

        let rejected = plugins.rejected().to_vec();
        let clients = ClientManager::new(
            plugins.plugins().cloned(),
            settings,
            ManagerDeps {
                factory,
                logs: Arc::clone(&logs),
                health: health.clone(),
                lifecycle: Arc::clone(&lifecycle),
                providers: Arc::clone(&providers),
                rules,
            },
        );

        Self {
            clients,
            logs,
            health,
            lifecycle,
            providers,
            rejected: RwLock::new(rejected),
        }
    }

    pub async fn start(&self, name: &str) -> Result<PluginStatus, EngineError> {
        self.clients.start(name).await
    }

    pub async fn stop(&self, name: &str) -> Result<PluginStatus, EngineError> {
        self.clients.stop(name).await
    }

    pub async fn restart(&self, name: &str) -> Result<PluginStatus, EngineError> {
        self.clients.restart(name).await
    }

    /// Start every plugin not disabled in configuration.
    pub async fn start_all(&self) -> Vec<(String, EngineError)> {
        let failures = self.clients.start_all().await;
        info!(failed = failures.len(), "plugin autostart finished");
        failures
    }

    /// Stop every plugin and flush the audit trail.
    pub async fn shutdown(&self) {
        self.clients.shutdown().await;
        self.lifecycle.audit().flush().await;
        info!("plugin engine stopped");
    }

    /// Swap in a new plugin generation and stop the old one.
    pub async fn reload(&self, plugins: PluginSet) {
        let settings = plugins.settings().clone();
        let rejected = plugins.rejected().to_vec();
        self.clients
            .replace_plugins(plugins.plugins().cloned(), settings)
            .await;

        let names = self.clients.names();
        let keep = |plugin: &str| names.iter().any(|name| name == plugin);
        self.logs.retain_plugins(keep).await;
        self.health.retain_plugins(keep).await;
        self.providers.retain_plugins(keep);
        *self.rejected.write().unwrap_or_else(PoisonError::into_inner) = rejected;
        info!(count = names.len(), "plugin engine reloaded");
    }

    /// Every plugin, sorted by name.
    pub async fn list(&self) -> Vec<PluginDetail> {
        let mut names = self.clients.names();
        names.sort();
        let mut details = Vec::with_capacity(names.len());
        for name in names {
            if let Ok(detail) = self.detail(&name).await {
                details.push(detail);
            }
        }
        details
    }

    /// Inspection snapshot with secrets masked.
    pub async fn detail(&self, name: &str) -> Result<PluginDetail, EngineError> {
        let snapshot = self.clients.snapshot(name).await?;
        let config = &snapshot.config;
        let (env, headers) = match &config.transport {
            TransportConfig::Local { env, .. } => (env.iter().map(|var| var.masked()).collect(), Vec::new()),
            TransportConfig::Remote { headers, .. } => {
                (Vec::new(), headers.iter().map(|var| var.masked()).collect())
            }
        };
        let (metrics, tool_count) = match &snapshot.client {
            Some(client) => (
                client.metrics(),
                client.cached_tools().map(|tools| tools.len()).unwrap_or_default(),
            ),
            None => Default::default(),
        };

        Ok(PluginDetail {
            name: config.name.clone(),
            status: snapshot.runtime.status,
            transport: config.transport_kind(),
            command_or_url: config.target(),
            env,
            headers,
            tags: config.tags.clone(),
            disabled: config.disabled,
            last_start: snapshot.runtime.last_start,
            consecutive_failures: snapshot.runtime.consecutive_failures,
            last_error: snapshot.runtime.last_error.clone(),
            health: self.health.latest(name).await,
            metrics,
            tool_count,
            logs: self.logs.recent_logs(name, DETAIL_LOG_LINES).await,
        })
    }

    pub async fn status(&self, name: &str) -> Result<PluginStatus, EngineError> {
        self.clients.status(name).await
    }

    /// Latest health record, if the plugin was ever probed.
    pub async fn health(&self, name: &str) -> Result<Option<HealthRecord>, EngineError> {
        self.ensure_known(name)?;
        Ok(self.health.latest(name).await)
    }

    pub async fn health_history(&self, name: &str) -> Result<Vec<HealthRecord>, EngineError> {
        self.ensure_known(name)?;
        Ok(self.health.history(name).await)
    }

    /// Invoke `tool` on a connected plugin.
    pub async fn invoke(&self, name: &str, tool: &str, arguments: Value) -> Result<ToolOutput, EngineError> {
        self.clients.invoke(name, tool, arguments).await
    }

    pub async fn logs(&self, name: &str, count: usize) -> Result<Vec<LogEntry>, EngineError> {
        self.ensure_known(name)?;
        Ok(self.logs.recent_logs(name, count).await)
    }

    /// Export a plugin's buffer with sensitive values redacted.
    pub async fn export_logs(&self, name: &str, path: &Path) -> Result<(), EngineError> {
        self.ensure_known(name)?;
        Ok(self.logs.export_logs(name, path).await?)
    }

    /// Export a plugin's buffer exactly as captured.
    pub async fn export_logs_unredacted(&self, name: &str, path: &Path) -> Result<(), EngineError> {
        self.ensure_known(name)?;
        Ok(self.logs.export_logs_unredacted(name, path).await?)
    }

    /// Contracts of every connected plugin.
    pub fn providers(&self) -> Vec<ProviderContract> {
        self.providers.contracts()
    }

    pub fn provider(&self, plugin: &str, tool: &str) -> Option<ProviderContract> {
        self.providers.contract(plugin, tool)
    }

    /// Invoke a provider tool and extract its values.
    pub async fn fetch(&self, plugin: &str, tool: &str, arguments: Value) -> Result<Vec<Value>, EngineError> {
        let client = self.clients.client(plugin).await?;
        self.providers
            .fetch(&client, tool, arguments)
            .await
            .map_err(EngineError::Provider)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Plugins the last load could not resolve.
    pub fn rejected(&self) -> Vec<RejectedPlugin> {
        self.rejected.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn lifecycle(&self) -> &LifecycleCoordinator {
        &self.lifecycle
    }

    pub fn log_manager(&self) -> &LogManager {
        &self.logs
    }

    pub fn client_manager(&self) -> &ClientManager {
        &self.clients
    }

    fn ensure_known(&self, name: &str) -> Result<(), EngineError> {
        self.clients
            .config(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound { name: name.to_string() })
    }
}

#[async_trait]
impl ValueProvider for PluginEngine {
    async fn fetch_values(&self, provider_id: &str, arguments: &Map<String, Value>) -> Result<Vec<Value>, ProviderError> {
        let Some((plugin, tool)) = split_provider_id(provider_id) else {
            return Err(ProviderError::UnknownTool {
                provider: provider_id.to_string(),
            });
        };
        let client = self
            .clients
            .client(plugin)
            .await
            .map_err(|error| ProviderError::Unavailable {
                provider: provider_id.to_string(),
                reason: error.user_message(),
            })?;
        self.providers
            .fetch(&client, tool, Value::Object(arguments.clone()))
            .await
    }

    fn contract(&self, provider_id: &str) -> Option<ProviderContract> {
        let (plugin, tool) = split_provider_id(provider_id)?;
        self.providers.contract(plugin, tool)
    }

    fn provider_ids(&self) -> Vec<String> {
        self.providers
            .contracts()
            .iter()
            .map(ProviderContract::id)
            .collect()
    }
}

/// Errors returned by the engine facade.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("plugin '{name}' is not configured")]
    NotFound { name: String },

    #[error("plugin '{name}' is disabled in configuration")]
    Disabled { name: String },

    #[error("plugin '{name}' is not running (status: {status})")]
    NotRunning { name: String, status: PluginStatus },

    #[error("{operation} of plugin '{name}' timed out after {timeout_ms}ms")]
    Timeout {
        name: String,
        operation: String,
        timeout_ms: u64,
    },

    #[error("operation on plugin '{name}' was cancelled by a later request")]
    Cancelled { name: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Provider(ProviderError),

    #[error(transparent)]
    Log(#[from] LogError),
}

impl EngineError {
    /// Whether the plugin rejected the configured credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Provider(ProviderError::Unauthorized { .. }))
    }

    /// Display form with sensitive values redacted.
    pub fn user_message(&self) -> String {
        redact_sensitive(&self.to_string())
    }
}

impl From<TransportError> for EngineError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Auth(auth) => Self::Auth(auth),
            other => Self::Transport(other),
        }
    }
}

impl From<InvokeError> for EngineError {
    fn from(error: InvokeError) -> Self {
        match error {
            InvokeError::Tool(tool) => Self::Tool(tool),
            InvokeError::Transport(transport) => Self::Transport(transport),
            InvokeError::Auth(auth) => Self::Auth(auth),
        }
    }
}
