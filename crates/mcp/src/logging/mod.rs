//! Logging system for plugins.

mod audit;
mod formatter;
mod ring_buffer;

pub use audit::{AuditAction, AuditError, AuditEvent, AuditLogger, AuditOutcome, AuditTrail};
pub use formatter::LogFormatter;
pub use ring_buffer::LogRingBuffer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dirs_next::config_dir;
use tendril_util::RedactionRules;
use tokio::sync::Mutex;
use tracing::warn;

use crate::types::{LogEntry, LogError};

const DEFAULT_MAX_LOG_ENTRIES_PER_PLUGIN: usize = 1000;

/// Stores and manages logs for all plugins.
///
/// Messages are redacted when they enter a buffer; the original text of each
/// entry stays in memory and only leaves through
/// [`LogManager::export_logs_unredacted`].
#[derive(Debug)]
pub struct LogManager {
    buffers: Mutex<HashMap<String, LogRingBuffer>>,
    formatter: LogFormatter,
    max_entries_per_plugin: usize,
}

impl LogManager {
    pub fn new() -> Self {
        Self::with_rules(DEFAULT_MAX_LOG_ENTRIES_PER_PLUGIN, Arc::new(RedactionRules::default()))
    }

    pub fn with_rules(max_entries_per_plugin: usize, rules: Arc<RedactionRules>) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            formatter: LogFormatter::with_rules(rules),
            max_entries_per_plugin: max_entries_per_plugin.max(1),
        }
    }

    /// Adds a log entry to the plugin's ring buffer.
    pub async fn add_log(&self, entry: LogEntry) {
        let redacted = self.formatter.redact_message(&entry.message);
        let entry = if redacted == entry.message {
            entry
        } else {
            entry.with_redacted_message(redacted)
        };

        let mut buffers = self.buffers.lock().await;
        buffers
            .entry(entry.plugin_name.clone())
            .or_insert_with(|| LogRingBuffer::new(self.max_entries_per_plugin))
            .push(entry);
    }

    /// Returns up to `count` most recent log entries for `plugin_name`.
    pub async fn recent_logs(&self, plugin_name: &str, count: usize) -> Vec<LogEntry> {
        let buffers = self.buffers.lock().await;
        buffers.get(plugin_name).map_or_else(Vec::new, |buffer| buffer.recent(count))
    }

    /// Returns all buffered log entries for `plugin_name`.
    pub async fn all_logs(&self, plugin_name: &str) -> Vec<LogEntry> {
        let buffers = self.buffers.lock().await;
        buffers.get(plugin_name).map_or_else(Vec::new, LogRingBuffer::entries)
    }

    pub async fn clear_logs(&self, plugin_name: &str) {
        let mut buffers = self.buffers.lock().await;
        if let Some(buffer) = buffers.get_mut(plugin_name) {
            buffer.clear();
        }
    }

    /// Drop the buffers of plugins that are no longer configured.
    pub async fn retain_plugins(&self, keep: impl Fn(&str) -> bool) {
        let mut buffers = self.buffers.lock().await;
        buffers.retain(|name, _| keep(name));
    }

    /// Exports all logs for `plugin_name`, redacted.
    pub async fn export_logs(&self, plugin_name: &str, path: &Path) -> Result<(), LogError> {
        self.export(plugin_name, path, false).await
    }

    /// Exports all logs for `plugin_name` with their original text.
    pub async fn export_logs_unredacted(&self, plugin_name: &str, path: &Path) -> Result<(), LogError> {
        warn!(plugin = %plugin_name, path = %path.display(), "exporting unredacted plugin logs");
        self.export(plugin_name, path, true).await
    }

    async fn export(&self, plugin_name: &str, path: &Path, raw: bool) -> Result<(), LogError> {
        let logs = self.all_logs(plugin_name).await;
        let mut content = String::new();
        for log in &logs {
            content.push_str(&self.formatter.format_for_export(log, raw));
            content.push('\n');
        }

        tokio::fs::write(path, content)
            .await
            .map_err(|error| LogError::export_failed(path, error.to_string()))
    }

    pub fn formatter(&self) -> &LogFormatter {
        &self.formatter
    }
}

impl Default for LogManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the default path for audit logs.
pub fn default_audit_log_path() -> PathBuf {
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tendril")
        .join("plugin-audit.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogLevel, LogSource};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_log_manager() {
        let manager = LogManager::new();
        manager.add_log(LogEntry::system("Test message", "test-plugin")).await;

        let logs = manager.recent_logs("test-plugin", 10).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "Test message");
        assert!(manager.recent_logs("other", 10).await.is_empty());
    }

    #[tokio::test]
    async fn capacity_drops_oldest_entries() {
        let manager = LogManager::with_rules(3, Arc::new(RedactionRules::default()));
        for i in 0..5 {
            manager.add_log(LogEntry::system(format!("line {i}"), "p")).await;
        }
        let messages: Vec<_> = manager.all_logs("p").await.into_iter().map(|entry| entry.message).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn entries_are_redacted_on_insert() {
        let manager = LogManager::new();
        manager
            .add_log(LogEntry::new(LogLevel::Warn, "auth failed token=abc123", LogSource::Stderr, "p"))
            .await;

        let logs = manager.recent_logs("p", 1).await;
        assert_eq!(logs[0].message, "auth failed token=[REDACTED]");
        assert_eq!(logs[0].raw_message(), "auth failed token=abc123");
    }

    #[tokio::test]
    async fn custom_keys_are_redacted() {
        let rules = RedactionRules::with_extra_keys(["session"]).unwrap();
        let manager = LogManager::with_rules(10, Arc::new(rules));
        manager.add_log(LogEntry::system("session=xyz789 opened", "p")).await;
        assert_eq!(manager.recent_logs("p", 1).await[0].message, "session=[REDACTED] opened");
    }

    #[tokio::test]
    async fn test_export_logs_with_and_without_redaction() {
        let manager = LogManager::new();
        let secret_msg = "API key: abc123def456";
        manager.add_log(LogEntry::system(secret_msg, "p")).await;

        let dir = TempDir::new().unwrap();
        let redacted_path = dir.path().join("redacted.log");
        let raw_path = dir.path().join("raw.log");

        manager.export_logs("p", &redacted_path).await.unwrap();
        manager.export_logs_unredacted("p", &raw_path).await.unwrap();

        let redacted = tokio::fs::read_to_string(&redacted_path).await.unwrap();
        let raw = tokio::fs::read_to_string(&raw_path).await.unwrap();

        assert!(redacted.contains("[REDACTED]"));
        assert!(!redacted.contains("abc123def456"));
        assert!(raw.contains(secret_msg));
    }

    #[tokio::test]
    async fn export_to_missing_directory_fails() {
        let manager = LogManager::new();
        manager.add_log(LogEntry::system("hello", "p")).await;
        let dir = TempDir::new().unwrap();
        let result = manager.export_logs("p", &dir.path().join("missing").join("out.log")).await;
        assert!(matches!(result, Err(LogError::ExportFailed { .. })));
    }
}
