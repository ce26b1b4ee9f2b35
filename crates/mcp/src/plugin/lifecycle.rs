//! Plugin lifecycle state and the coordinator that moves it.
//!
//! Every status change goes through [`LifecycleCoordinator::transition`],
//! which enforces the state machine, stamps the change, appends an audit
//! event, broadcasts a [`LifecycleEvent`] and writes a system line into the
//! plugin's log buffer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tendril_util::RedactionRules;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::logging::{AuditAction, AuditEvent, AuditOutcome, AuditTrail, LogManager};
use crate::types::{LogEntry, LogLevel, LogSource, PluginStatus};

const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

/// Mutable lifecycle state of one plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginRuntimeState {
    pub status: PluginStatus,
    /// Last transition into Running.
    pub last_start: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Redacted.
    pub last_error: Option<String>,
    /// Incremented on every successful connect.
    pub epoch: u64,
    /// Delay of the most recently scheduled retry.
    #[serde(default, with = "duration_ms")]
    pub last_backoff: Option<Duration>,
}

/// A status change, as broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub plugin: String,
    pub from: PluginStatus,
    pub to: PluginStatus,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub reason: Option<String>,
}

/// Audit context of one transition.
#[derive(Debug, Clone, Copy)]
pub struct Transition<'a> {
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub correlation_id: Uuid,
    pub reason: Option<&'a str>,
}

impl<'a> Transition<'a> {
    pub fn new(action: AuditAction, outcome: AuditOutcome, correlation_id: Uuid) -> Self {
        Self {
            action,
            outcome,
            correlation_id,
            reason: None,
        }
    }

    pub fn because(mut self, reason: &'a str) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Applies transitions and fans them out to audit, logs and subscribers.
#[derive(Debug)]
pub struct LifecycleCoordinator {
    audit: AuditTrail,
    logs: Arc<LogManager>,
    events: broadcast::Sender<LifecycleEvent>,
    rules: Arc<RedactionRules>,
}

impl LifecycleCoordinator {
    pub fn new(audit: AuditTrail, logs: Arc<LogManager>, rules: Arc<RedactionRules>) -> Self {
        let (events, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self {
            audit,
            logs,
            events,
            rules,
        }
    }

    /// Move `runtime` to `to`. Returns `false` when the edge is illegal; the
    /// state is then left untouched. Moving to the current status is a no-op.
    pub async fn transition(
        &self,
        plugin: &str,
        runtime: &mut PluginRuntimeState,
        to: PluginStatus,
        step: Transition<'_>,
    ) -> bool {
        let from = runtime.status;
        if from == to {
            return true;
        }
        if !from.can_transition_to(to) {
            warn!(plugin = %plugin, from = %from, to = %to, "rejected illegal lifecycle transition");
            return false;
        }

        let timestamp = Utc::now();
        runtime.status = to;
        if to == PluginStatus::Running {
            runtime.last_start = Some(timestamp);
        }

        let reason = step.reason.map(|reason| self.rules.redact(reason));
        let mut audit = AuditEvent::new(plugin, step.action, step.outcome, step.correlation_id).with_transition(from, to);
        if let Some(reason) = &reason {
            audit = audit.with_metadata("reason", reason.as_str());
        }
        self.audit.record(audit);

        let _ = self.events.send(LifecycleEvent {
            plugin: plugin.to_string(),
            from,
            to,
            timestamp,
            correlation_id: step.correlation_id,
            reason: reason.clone(),
        });

        let level = if to.is_failed() { LogLevel::Warn } else { LogLevel::Info };
        let message = match &reason {
            Some(reason) => format!("{from} -> {to}: {reason}"),
            None => format!("{from} -> {to}"),
        };
        self.logs
            .add_log(LogEntry::new(level, message, LogSource::System, plugin))
            .await;

        info!(plugin = %plugin, from = %from, to = %to, correlation_id = %step.correlation_id, "plugin status changed");
        true
    }

    /// Record an operation-level audit event that is not a transition.
    pub fn record(&self, event: AuditEvent) {
        self.audit.record(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn logs(&self) -> &Arc<LogManager> {
        &self.logs
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(|duration| duration.as_millis() as u64).serialize(serializer)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
