//! Core types for plugin management.

pub mod errors;
pub mod plugin;
pub mod status;
pub mod tools;

pub use errors::{AuthError, InvokeError, LogError, ToolError, TransportError};
pub use plugin::{ClientMetrics, LogEntry, LogLevel, LogSource, PluginDetail};
pub use status::{HealthRecord, PluginStatus, TransportKind};
pub use tools::{ToolDescriptor, ToolOutput};
