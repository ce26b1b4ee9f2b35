//! Audit logging for plugin lifecycle events.
//!
//! Lifecycle code records events through an [`AuditTrail`] handle, which
//! only pushes onto a channel. A single writer task drains the channel and
//! appends JSON lines through [`AuditLogger`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tendril_util::RedactionRules;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AuditSettings;
use crate::types::PluginStatus;

/// An audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,

    pub plugin_name: String,

    pub action: AuditAction,

    pub outcome: AuditOutcome,

    /// Shared by every event emitted for one operation.
    pub correlation_id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PluginStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PluginStatus>,

    /// Additional metadata, redacted before it is written.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Actions that can be audited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Start,
    Stop,
    Restart,
    Invoke,
    HealthCheck,
}

/// Result of an audited action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    InProgress,
    Cancelled,
    Skipped,
}

impl AuditEvent {
    pub fn new(plugin_name: impl Into<String>, action: AuditAction, outcome: AuditOutcome, correlation_id: Uuid) -> Self {
        Self {
            timestamp: Utc::now(),
            plugin_name: plugin_name.into(),
            action,
            outcome,
            correlation_id,
            from: None,
            to: None,
            metadata: Map::new(),
        }
    }

    /// Record the status edge this event describes.
    pub fn with_transition(mut self, from: PluginStatus, to: PluginStatus) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Create a tool invocation audit entry.
    pub fn tool_invoke(plugin_name: impl Into<String>, tool_name: &str, outcome: AuditOutcome) -> Self {
        Self::new(plugin_name, AuditAction::Invoke, outcome, Uuid::new_v4()).with_metadata("tool_name", tool_name)
    }

    /// Create a health check audit entry.
    pub fn health_check(plugin_name: impl Into<String>, healthy: bool, latency_ms: Option<u64>) -> Self {
        let outcome = if healthy {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        let mut event =
            Self::new(plugin_name, AuditAction::HealthCheck, outcome, Uuid::new_v4()).with_metadata("healthy", healthy);
        if let Some(latency) = latency_ms {
            event = event.with_metadata("latency_ms", latency);
        }
        event
    }
}

/// Appends audit events to a JSON-lines file with size and age rotation.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    log_path: PathBuf,
    max_size: u64,
    max_age_days: u64,
}

impl AuditLogger {
    pub fn with_settings(log_path: PathBuf, max_size: u64, max_age_days: u64) -> Self {
        Self {
            log_path,
            max_size,
            max_age_days,
        }
    }

    pub fn from_settings(settings: &AuditSettings) -> Self {
        Self::with_settings(settings.path.clone(), settings.max_bytes, settings.max_age_days)
    }

    /// Append one event, redacting its metadata with `rules`.
    pub async fn log(&self, event: AuditEvent, rules: &RedactionRules) -> Result<(), AuditError> {
        if let Some(parent) = self.log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        if self.should_rotate().await? {
            self.rotate_log().await?;
        }

        let event = redact_event(event, rules);
        let mut json_line = serde_json::to_string(&event).map_err(|e| AuditError::Serialization(e.to_string()))?;
        json_line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.log_path).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.log_path, permissions).await?;
        }

        file.write_all(json_line.as_bytes()).await?;
        file.flush().await?;

        debug!(
            plugin = %event.plugin_name,
            action = ?event.action,
            outcome = ?event.outcome,
            "audit event written"
        );

        Ok(())
    }

    async fn should_rotate(&self) -> Result<bool, AuditError> {
        let metadata = match tokio::fs::metadata(&self.log_path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(error) => return Err(error.into()),
        };

        if metadata.len() > self.max_size {
            return Ok(true);
        }

        let modified = metadata.modified()?;
        let age = std::time::SystemTime::now().duration_since(modified).unwrap_or_default();

        Ok(age.as_secs() > self.max_age_days * 24 * 60 * 60)
    }

    async fn rotate_log(&self) -> Result<(), AuditError> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let rotated_path = self.log_path.with_extension(format!("{}.jsonl", timestamp));

        tokio::fs::rename(&self.log_path, &rotated_path).await?;
        debug!("Rotated audit log: {} -> {}", self.log_path.display(), rotated_path.display());
        Ok(())
    }

    /// Read up to `count` of the most recent events, oldest first.
    pub async fn read_recent(&self, count: usize) -> Result<Vec<AuditEvent>, AuditError> {
        let content = match tokio::fs::read_to_string(&self.log_path).await {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut entries: Vec<AuditEvent> = content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect();
        entries.reverse();
        Ok(entries)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

fn redact_event(mut event: AuditEvent, rules: &RedactionRules) -> AuditEvent {
    let metadata = std::mem::take(&mut event.metadata);
    if let Value::Object(redacted) = rules.redact_json(&Value::Object(metadata)) {
        event.metadata = redacted;
    }
    event
}

/// Errors that can occur during audit logging.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

enum AuditMessage {
    Event(AuditEvent),
    Flush(oneshot::Sender<()>),
}

/// Cloneable, non-blocking handle to the audit writer task.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    sender: Option<mpsc::UnboundedSender<AuditMessage>>,
    logger: Option<AuditLogger>,
}

impl std::fmt::Debug for AuditMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditMessage::Event(event) => f.debug_tuple("Event").field(&event.action).finish(),
            AuditMessage::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl AuditTrail {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(logger: AuditLogger, rules: Arc<RedactionRules>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<AuditMessage>();
        let writer = logger.clone();

        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    AuditMessage::Event(event) => {
                        if let Err(error) = writer.log(event, &rules).await {
                            warn!(path = %writer.log_path().display(), error = %error, "failed to write audit event");
                        }
                    }
                    AuditMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("audit writer stopped");
        });

        Self {
            sender: Some(sender),
            logger: Some(logger),
        }
    }

    /// A trail that drops every event.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            logger: None,
        }
    }

    pub fn record(&self, event: AuditEvent) {
        if let Some(sender) = &self.sender
            && sender.send(AuditMessage::Event(event)).is_err()
        {
            warn!("audit writer is gone; dropping event");
        }
    }

    /// Wait until every event recorded so far has been written.
    pub async fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if sender.send(AuditMessage::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Read back the newest events from the audit file.
    pub async fn read_recent(&self, count: usize) -> Result<Vec<AuditEvent>, AuditError> {
        match &self.logger {
            Some(logger) => logger.read_recent(count).await,
            None => Ok(Vec::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.logger.as_ref().map(AuditLogger::log_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_audit_logger() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("audit.jsonl");
        let logger = AuditLogger::with_settings(log_path.clone(), 1024 * 1024, 1);

        let event = AuditEvent::new("test-plugin", AuditAction::Start, AuditOutcome::Success, Uuid::new_v4())
            .with_transition(PluginStatus::Starting, PluginStatus::Running);
        logger.log(event, &RedactionRules::default()).await.unwrap();

        let entries = logger.read_recent(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].plugin_name, "test-plugin");
        assert_eq!(entries[0].action, AuditAction::Start);
        assert_eq!(entries[0].to, Some(PluginStatus::Running));

        let line = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(line.contains("\"action\":\"start\""));
        assert!(line.contains("\"outcome\":\"success\""));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn audit_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("audit.jsonl");
        let logger = AuditLogger::with_settings(log_path.clone(), 1024 * 1024, 1);
        logger
            .log(AuditEvent::health_check("p", true, Some(3)), &RedactionRules::default())
            .await
            .unwrap();

        let mode = std::fs::metadata(&log_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn metadata_is_redacted_before_writing() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("audit.jsonl");
        let logger = AuditLogger::with_settings(log_path.clone(), 1024 * 1024, 1);

        let event = AuditEvent::tool_invoke("p", "deploy", AuditOutcome::Failure)
            .with_metadata("error", "request failed: token=abc123")
            .with_metadata("password", "hunter2");
        logger.log(event, &RedactionRules::default()).await.unwrap();

        let content = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(!content.contains("abc123"));
        assert!(!content.contains("hunter2"));
        assert!(content.contains("deploy"));
    }

    #[tokio::test]
    async fn oversized_log_is_rotated() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("audit.jsonl");
        let logger = AuditLogger::with_settings(log_path.clone(), 10, 7);
        let rules = RedactionRules::default();

        logger.log(AuditEvent::health_check("p", true, None), &rules).await.unwrap();
        logger.log(AuditEvent::health_check("p", false, None), &rules).await.unwrap();

        let rotated: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("audit.") && name != "audit.jsonl")
            .collect();
        assert_eq!(rotated.len(), 1);
        assert!(rotated[0].ends_with(".jsonl"));
        assert_eq!(logger.read_recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trail_flush_waits_for_queued_events() {
        let temp_dir = TempDir::new().unwrap();
        let logger = AuditLogger::with_settings(temp_dir.path().join("nested").join("audit.jsonl"), 1024 * 1024, 7);
        let trail = AuditTrail::spawn(logger, Arc::new(RedactionRules::default()));

        let correlation_id = Uuid::new_v4();
        for outcome in [AuditOutcome::InProgress, AuditOutcome::Success] {
            trail.record(AuditEvent::new("p", AuditAction::Restart, outcome, correlation_id));
        }
        trail.flush().await;

        let events = trail.read_recent(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.correlation_id == correlation_id));
        assert_eq!(events[1].outcome, AuditOutcome::Success);
    }

    #[tokio::test]
    async fn disabled_trail_accepts_and_drops_events() {
        let trail = AuditTrail::disabled();
        trail.record(AuditEvent::health_check("p", true, None));
        trail.flush().await;
        assert!(trail.read_recent(5).await.unwrap().is_empty());
        assert!(trail.path().is_none());
    }
}
