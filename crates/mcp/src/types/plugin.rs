//! Plugin-related data structures.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tendril_types::EnvVar;

use crate::types::{HealthRecord, PluginStatus, TransportKind};

/// Snapshot of a plugin for display and inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDetail {
    /// Plugin name.
    pub name: String,

    /// Current lifecycle status.
    pub status: PluginStatus,

    /// Transport used to reach the plugin.
    pub transport: TransportKind,

    /// Command line or base URL.
    pub command_or_url: String,

    /// Environment overrides, masked.
    pub env: Vec<EnvVar>,

    /// Request headers, masked.
    pub headers: Vec<EnvVar>,

    /// Tags associated with the plugin.
    pub tags: Vec<String>,

    /// Disabled in configuration.
    pub disabled: bool,

    /// Last transition into Running.
    pub last_start: Option<DateTime<Utc>>,

    /// Failures since the last healthy probe or manual start.
    pub consecutive_failures: u32,

    /// Redacted description of the most recent failure.
    pub last_error: Option<String>,

    /// Latest probe result.
    pub health: Option<HealthRecord>,

    /// Invocation counters.
    pub metrics: ClientMetrics,

    /// Number of tools advertised by the plugin.
    pub tool_count: usize,

    /// Most recent log lines, redacted.
    pub logs: Vec<LogEntry>,
}

impl PluginDetail {
    /// Check if the plugin is running.
    pub fn is_running(&self) -> bool {
        matches!(self.status, PluginStatus::Running)
    }

    /// Check if the plugin is running and its last probe succeeded.
    pub fn is_healthy(&self) -> bool {
        self.is_running() && self.health.as_ref().is_none_or(|record| record.reachable)
    }
}

/// Invocation counters for one managed client.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientMetrics {
    pub invocations: u64,
    pub errors: u64,
    pub last_latency_ms: Option<u64>,
}

/// A log entry from a plugin.
///
/// `message` is the display form. When the entry passed through the log
/// manager it is redacted and the original text is kept in memory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Timestamp of the log entry.
    pub timestamp: DateTime<Utc>,

    /// Log level.
    pub level: LogLevel,

    /// Log message.
    pub message: String,

    /// Source of the log (stdout, stderr, or system).
    pub source: LogSource,

    /// Plugin name that generated this log.
    pub plugin_name: String,

    #[serde(skip)]
    raw: Option<Arc<str>>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(level: LogLevel, message: impl Into<String>, source: LogSource, plugin_name: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            source,
            plugin_name: plugin_name.into(),
            raw: None,
        }
    }

    /// Create a system log entry.
    pub fn system(message: impl Into<String>, plugin_name: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message, LogSource::System, plugin_name)
    }

    /// Create an error log entry.
    pub fn error(message: impl Into<String>, source: LogSource, plugin_name: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message, source, plugin_name)
    }

    /// Replace the display message with `redacted`, keeping the original.
    pub(crate) fn with_redacted_message(mut self, redacted: String) -> Self {
        if self.raw.is_none() {
            self.raw = Some(Arc::from(std::mem::take(&mut self.message)));
        }
        self.message = redacted;
        self
    }

    /// Original, unredacted text.
    pub fn raw_message(&self) -> &str {
        self.raw.as_deref().unwrap_or(&self.message)
    }

    /// Format the log entry for display.
    pub fn format(&self) -> String {
        format!(
            "[{}] {} {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.level,
            self.source,
            self.message
        )
    }
}

/// Log level for plugin logs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "err"),
        }
    }
}

/// Source of a log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// Standard output from the plugin.
    Stdout,
    /// Standard error from the plugin.
    Stderr,
    /// System-generated log.
    System,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Stdout => write!(f, "stdout"),
            LogSource::Stderr => write!(f, "stderr"),
            LogSource::System => write!(f, "system"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_formatting() {
        let log = LogEntry::new(LogLevel::Info, "Plugin started", LogSource::System, "test");

        let formatted = log.format();
        assert!(formatted.contains("info"));
        assert!(formatted.contains("system"));
        assert!(formatted.contains("Plugin started"));
    }

    #[test]
    fn redacted_entry_keeps_raw_in_memory_only() {
        let entry = LogEntry::new(LogLevel::Warn, "token=abc", LogSource::Stderr, "p")
            .with_redacted_message("token=[REDACTED]".to_string());
        assert_eq!(entry.message, "token=[REDACTED]");
        assert_eq!(entry.raw_message(), "token=abc");

        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("abc"));
    }
}
