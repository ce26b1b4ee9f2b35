//! Log formatting with redaction.

use std::sync::Arc;

use tendril_util::RedactionRules;

use crate::types::LogEntry;

/// Formats log entries for display and export.
#[derive(Debug, Clone)]
pub struct LogFormatter {
    redaction_rules: Arc<RedactionRules>,
}

impl LogFormatter {
    pub fn new() -> Self {
        Self::with_rules(Arc::new(RedactionRules::default()))
    }

    pub fn with_rules(redaction_rules: Arc<RedactionRules>) -> Self {
        Self { redaction_rules }
    }

    /// Format a log entry for display.
    pub fn format(&self, entry: &LogEntry) -> String {
        format!(
            "[{}] {} {}: {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.level,
            entry.source,
            self.redact_message(&entry.message)
        )
    }

    /// Format a log entry for a file export; `raw` selects the unredacted text.
    pub fn format_for_export(&self, entry: &LogEntry, raw: bool) -> String {
        let message = if raw {
            entry.raw_message().to_string()
        } else {
            self.redact_message(&entry.message)
        };
        format!(
            "[{}] {} {} {}: {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f UTC"),
            entry.plugin_name,
            entry.level,
            entry.source,
            message
        )
    }

    pub fn redact_message(&self, message: &str) -> String {
        self.redaction_rules.redact(message)
    }

    pub fn redaction_rules(&self) -> &Arc<RedactionRules> {
        &self.redaction_rules
    }
}

impl Default for LogFormatter {
    fn default() -> Self {
        Self::new()
    }
}
