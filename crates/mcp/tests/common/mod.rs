#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexSet;
use tempfile::TempDir;
use tendril_mcp::config::{AuditSettings, BackoffSettings, TransportConfig};
use tendril_mcp::logging::AuditEvent;
use tendril_mcp::{EngineSettings, PluginConfig, PluginEngine, PluginStatus};

pub fn fake_plugin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/fake_plugin.sh")
}

/// Fast probes, a short retry backoff and an audit file inside `dir`.
pub fn fast_settings(dir: &TempDir) -> EngineSettings {
    EngineSettings {
        health_interval: Duration::from_millis(200),
        probe_timeout: Duration::from_millis(150),
        operation_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(2),
        invoke_timeout: Duration::from_secs(5),
        max_consecutive_failures: 3,
        failure_threshold: 3,
        backoff: BackoffSettings {
            base: Duration::from_millis(20),
            max: Duration::from_millis(80),
            jitter_ratio: 0.0,
        },
        audit: AuditSettings {
            path: dir.path().join("audit.jsonl"),
            ..AuditSettings::default()
        },
        ..EngineSettings::default()
    }
}

pub fn local_plugin(name: &str, command: &str, args: &[&str]) -> PluginConfig {
    PluginConfig {
        name: name.to_string(),
        transport: TransportConfig::Local {
            command: command.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            env: IndexSet::new(),
            cwd: None,
        },
        disabled: false,
        tags: vec![],
    }
}

pub fn fake_plugin(name: &str) -> PluginConfig {
    let script = fake_plugin_path();
    local_plugin(name, "sh", &[script.to_string_lossy().as_ref()])
}

/// Poll until `name` reaches `status`.
pub async fn wait_for_status(engine: &PluginEngine, name: &str, status: PluginStatus, within: Duration) {
    let reached = tokio::time::timeout(within, async {
        loop {
            if engine.status(name).await.ok() == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    let current = engine.status(name).await.ok();
    assert!(reached.is_ok(), "{name} never reached {status}; last seen {current:?}");
}

/// Status-changing audit events of `name`, oldest first.
pub async fn transitions(engine: &PluginEngine, name: &str) -> Vec<(PluginStatus, PluginStatus)> {
    audit_events(engine, name)
        .await
        .into_iter()
        .filter_map(|event| Some((event.from?, event.to?)))
        .collect()
}

pub async fn audit_events(engine: &PluginEngine, name: &str) -> Vec<AuditEvent> {
    let audit = engine.lifecycle().audit();
    audit.flush().await;
    audit
        .read_recent(1000)
        .await
        .unwrap()
        .into_iter()
        .filter(|event| event.plugin_name == name)
        .collect()
}
