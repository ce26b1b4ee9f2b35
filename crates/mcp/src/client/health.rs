//! Health monitoring for plugin clients.
//!
//! This module provides the `HealthMonitor`, a shared store for the latest
//! probe outcome of each plugin plus a short rolling history, and the probe
//! task that feeds it.
//!
//! ## Design
//!
//! - `HealthMonitor`: passive store, updated by probe tasks and by managed
//!   clients that observe a disconnect during an invocation.
//! - `spawn_probe_task`: one task per connected plugin. It pings the plugin
//!   every `interval`, records the outcome and reports it to a [`ProbeSink`]
//!   (the client manager), which decides on lifecycle consequences.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tendril_util::redact_sensitive;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::managed::ManagedClient;
use crate::types::HealthRecord;

const DEFAULT_HISTORY_WINDOW: usize = 20;

#[derive(Debug, Default)]
struct PluginHealth {
    latest: Option<HealthRecord>,
    history: VecDeque<HealthRecord>,
}

/// Latest probe record and rolling history per plugin.
#[derive(Clone, Debug)]
pub struct HealthMonitor {
    records: Arc<Mutex<HashMap<String, PluginHealth>>>,
    window: usize,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_HISTORY_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            window: window.max(1),
        }
    }

    /// Replace the latest record and push it into the history window.
    pub async fn record(&self, record: HealthRecord) {
        let mut records = self.records.lock().await;
        let health = records.entry(record.plugin.clone()).or_default();
        if health.history.len() == self.window {
            health.history.pop_front();
        }
        health.history.push_back(record.clone());
        health.latest = Some(record);
    }

    pub async fn latest(&self, plugin_name: &str) -> Option<HealthRecord> {
        let records = self.records.lock().await;
        records.get(plugin_name).and_then(|health| health.latest.clone())
    }

    /// Oldest first.
    pub async fn history(&self, plugin_name: &str) -> Vec<HealthRecord> {
        let records = self.records.lock().await;
        records
            .get(plugin_name)
            .map(|health| health.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn remove(&self, plugin_name: &str) {
        let mut records = self.records.lock().await;
        if records.remove(plugin_name).is_some() {
            debug!(plugin = %plugin_name, "dropped health history");
        }
    }

    pub async fn retain_plugins(&self, keep: impl Fn(&str) -> bool) {
        let mut records = self.records.lock().await;
        records.retain(|name, _| keep(name));
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a health report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeSource {
    /// Periodic ping.
    Probe,
    /// The connection reported that the peer went away.
    Disconnect,
}

/// A health observation for one connection generation.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub plugin: String,
    /// Connection epoch the observation belongs to.
    pub epoch: u64,
    pub record: HealthRecord,
    pub source: ProbeSource,
}

/// Receives probe reports and applies their lifecycle consequences.
#[async_trait]
pub trait ProbeSink: Send + Sync {
    /// Returns `false` once the report's connection is no longer the live
    /// one, which ends its probe task.
    async fn apply_probe(&self, report: ProbeReport) -> bool;
}

pub(crate) struct ProbeTask {
    pub(crate) plugin: String,
    pub(crate) epoch: u64,
    pub(crate) client: Arc<ManagedClient>,
    pub(crate) monitor: HealthMonitor,
    pub(crate) sink: Weak<dyn ProbeSink>,
    pub(crate) interval: Duration,
    pub(crate) probe_timeout: Duration,
    pub(crate) cancel: CancellationToken,
}

/// Probe one connected plugin until `cancel` fires or the sink goes away.
pub(crate) fn spawn_probe_task(task: ProbeTask) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ProbeTask {
            plugin,
            epoch,
            client,
            monitor,
            sink,
            interval,
            probe_timeout,
            cancel,
        } = task;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = tokio::time::timeout(probe_timeout, client.health_check()) => outcome,
            };

            let record = match outcome {
                Ok(outcome) if outcome.ok => HealthRecord::reachable(&plugin, outcome.latency.as_millis() as u64),
                Ok(outcome) => HealthRecord::unreachable(
                    &plugin,
                    redact_sensitive(outcome.error.as_deref().unwrap_or("probe failed")),
                ),
                Err(_) => HealthRecord::unreachable(
                    &plugin,
                    format!("probe timed out after {}ms", probe_timeout.as_millis()),
                ),
            };
            debug!(plugin = %plugin, epoch, reachable = record.reachable, "health probe finished");
            monitor.record(record.clone()).await;

            let Some(sink) = sink.upgrade() else { break };
            if cancel.is_cancelled() {
                break;
            }
            let live = sink
                .apply_probe(ProbeReport {
                    plugin: plugin.clone(),
                    epoch,
                    record,
                    source: ProbeSource::Probe,
                })
                .await;
            if !live {
                break;
            }
        }
        debug!(plugin = %plugin, epoch, "health probe task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_latest_and_bounded_history() {
        let monitor = HealthMonitor::with_window(3);
        for latency in 0..5 {
            monitor.record(HealthRecord::reachable("p", latency)).await;
        }
        monitor.record(HealthRecord::unreachable("p", "boom")).await;

        let latest = monitor.latest("p").await.unwrap();
        assert!(!latest.reachable);

        let history = monitor.history("p").await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].latency_ms, Some(3));
        assert_eq!(history[2].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn remove_and_retain_forget_plugins() {
        let monitor = HealthMonitor::new();
        monitor.record(HealthRecord::reachable("a", 1)).await;
        monitor.record(HealthRecord::reachable("b", 1)).await;
        monitor.record(HealthRecord::reachable("c", 1)).await;

        monitor.remove("a").await;
        monitor.retain_plugins(|name| name != "b").await;

        assert!(monitor.latest("a").await.is_none());
        assert!(monitor.latest("b").await.is_none());
        assert!(monitor.latest("c").await.is_some());
        assert!(monitor.history("missing").await.is_empty());
    }
}
