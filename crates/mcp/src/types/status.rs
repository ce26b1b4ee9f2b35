//! Status types for plugins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a plugin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Not connected.
    #[default]
    Stopped,
    /// Connecting.
    Starting,
    /// Connected and answering probes.
    Running,
    /// Connected but recent probes failed.
    Degraded,
    /// Disconnecting.
    Stopping,
    /// Connection lost or could not be established; a retry may be pending.
    Failed,
    /// Too many consecutive failures; waits for a manual start or restart.
    DisabledByFailure,
}

impl PluginStatus {
    /// Get the display icon for this status.
    pub fn icon(&self) -> &'static str {
        match self {
            PluginStatus::Running => "✓",
            PluginStatus::Degraded => "!",
            PluginStatus::Stopped => "·",
            PluginStatus::Failed | PluginStatus::DisabledByFailure => "✗",
            PluginStatus::Starting | PluginStatus::Stopping => "⏳",
        }
    }

    /// Get the display text for this status.
    pub fn display(&self) -> &'static str {
        match self {
            PluginStatus::Stopped => "Stopped",
            PluginStatus::Starting => "Starting",
            PluginStatus::Running => "Running",
            PluginStatus::Degraded => "Degraded",
            PluginStatus::Stopping => "Stopping",
            PluginStatus::Failed => "Failed",
            PluginStatus::DisabledByFailure => "Disabled (failures)",
        }
    }

    /// Running or Degraded: a live connection exists.
    pub fn is_connected(&self) -> bool {
        matches!(self, PluginStatus::Running | PluginStatus::Degraded)
    }

    /// Check if the plugin is in a transitional state.
    pub fn is_transitional(&self) -> bool {
        matches!(self, PluginStatus::Starting | PluginStatus::Stopping)
    }

    /// Check if the plugin is in a failure state.
    pub fn is_failed(&self) -> bool {
        matches!(self, PluginStatus::Failed | PluginStatus::DisabledByFailure)
    }

    /// Legal edges of the lifecycle state machine.
    pub fn can_transition_to(&self, next: PluginStatus) -> bool {
        use PluginStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopped)
                | (Running, Degraded)
                | (Running, Stopping)
                | (Running, Failed)
                | (Degraded, Running)
                | (Degraded, Stopping)
                | (Degraded, Failed)
                | (Stopping, Stopped)
                | (Failed, Starting)
                | (Failed, Stopped)
                | (Failed, DisabledByFailure)
                | (DisabledByFailure, Starting)
                | (DisabledByFailure, Stopped)
        )
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display())
    }
}

/// Outcome of one health probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthRecord {
    /// Plugin the probe targeted.
    pub plugin: String,

    /// When the probe completed.
    pub timestamp: DateTime<Utc>,

    /// Round-trip latency in milliseconds, when the probe got an answer.
    pub latency_ms: Option<u64>,

    /// Whether the plugin answered.
    pub reachable: bool,

    /// Redacted error text for failed probes.
    pub error: Option<String>,
}

impl HealthRecord {
    pub fn reachable(plugin: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            plugin: plugin.into(),
            timestamp: Utc::now(),
            latency_ms: Some(latency_ms),
            reachable: true,
            error: None,
        }
    }

    pub fn unreachable(plugin: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            timestamp: Utc::now(),
            latency_ms: None,
            reachable: false,
            error: Some(error.into()),
        }
    }
}

/// Kind of transport a plugin uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Local,
    Remote,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Local => write!(f, "local"),
            TransportKind::Remote => write!(f, "remote"),
        }
    }
}
