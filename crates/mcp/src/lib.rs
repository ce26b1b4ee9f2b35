//! Tendril plugin engine.
//!
//! Hosts declare plugins in a JSON document; the engine connects to them
//! over stdio or HTTP, supervises their lifecycle with health probes and
//! bounded retries, keeps redacted per-plugin logs plus an append-only
//! audit trail, and exposes their tools as generic value providers.

pub mod client;
pub mod config;
pub mod logging;
pub mod plugin;
pub mod provider;
pub mod types;

pub use config::{ConfigError, ConfigResolver, EngineSettings, PluginConfig, PluginSet};
pub use plugin::{EngineError, LifecycleEvent, PluginEngine};
pub use provider::{ProviderContract, ProviderError, ValueProvider};
pub use tendril_types::{EnvSource, EnvVar};
pub use types::{HealthRecord, LogEntry, PluginDetail, PluginStatus, ToolDescriptor, ToolOutput};
