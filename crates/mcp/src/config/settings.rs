//! Engine tuning: the authored `settings` block and its runtime form.

use std::path::PathBuf;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tendril_util::expand_tilde;

use crate::config::model::ConfigError;
use crate::logging::default_audit_log_path;

const DEFAULT_HEALTH_INTERVAL_MS: u64 = 30_000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_BACKOFF_JITTER: f64 = 0.2;
const DEFAULT_LOG_CAPACITY: usize = 1000;
const DEFAULT_AUDIT_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_AUDIT_MAX_AGE_DAYS: u64 = 7;

/// The optional `settings` block of the configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_consecutive_failures: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_base_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_max_ms: Option<u64>,
    /// Fraction of the delay added as random jitter, `0.0..=1.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_jitter: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_max_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_max_age_days: Option<u64>,
    /// Additional key names whose values are redacted from logs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redact_keys: Vec<String>,
}

/// Retry delay policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub base: Duration,
    pub max: Duration,
    pub jitter_ratio: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            jitter_ratio: DEFAULT_BACKOFF_JITTER,
        }
    }
}

/// Audit file location and rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditSettings {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub max_age_days: u64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            path: default_audit_log_path(),
            max_bytes: DEFAULT_AUDIT_MAX_BYTES,
            max_age_days: DEFAULT_AUDIT_MAX_AGE_DAYS,
        }
    }
}

/// Runtime settings of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    /// Deadline for start and restart.
    pub operation_timeout: Duration,
    pub stop_timeout: Duration,
    pub invoke_timeout: Duration,
    /// Failures before a plugin is disabled until a manual start.
    pub max_consecutive_failures: u32,
    /// Consecutive failed probes before the failure path runs.
    pub failure_threshold: u32,
    pub backoff: BackoffSettings,
    pub log_capacity: usize,
    pub audit: AuditSettings,
    pub redact_keys: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_millis(DEFAULT_HEALTH_INTERVAL_MS),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            invoke_timeout: Duration::from_millis(DEFAULT_INVOKE_TIMEOUT_MS),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            backoff: BackoffSettings::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            audit: AuditSettings::default(),
            redact_keys: Vec::new(),
        }
    }
}

impl EngineSettings {
    /// Apply an authored settings block over the defaults.
    pub fn from_document(document: Option<&SettingsDocument>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        let Some(document) = document else {
            return Ok(settings);
        };

        let millis = |value: Option<u64>, field: &str, default: Duration| -> Result<Duration, ConfigError> {
            match value {
                None => Ok(default),
                Some(0) => Err(ConfigError::Settings {
                    message: format!("{field} must be greater than zero"),
                }),
                Some(ms) => Ok(Duration::from_millis(ms)),
            }
        };

        settings.health_interval = millis(document.health_interval_ms, "healthIntervalMs", settings.health_interval)?;
        settings.probe_timeout = millis(document.probe_timeout_ms, "probeTimeoutMs", settings.probe_timeout)?;
        settings.operation_timeout =
            millis(document.operation_timeout_ms, "operationTimeoutMs", settings.operation_timeout)?;
        settings.stop_timeout = millis(document.stop_timeout_ms, "stopTimeoutMs", settings.stop_timeout)?;
        settings.invoke_timeout = millis(document.invoke_timeout_ms, "invokeTimeoutMs", settings.invoke_timeout)?;
        settings.backoff.base = millis(document.backoff_base_ms, "backoffBaseMs", settings.backoff.base)?;
        settings.backoff.max = millis(document.backoff_max_ms, "backoffMaxMs", settings.backoff.max)?;

        if settings.backoff.max < settings.backoff.base {
            return Err(ConfigError::Settings {
                message: "backoffMaxMs must not be smaller than backoffBaseMs".to_string(),
            });
        }

        if let Some(jitter) = document.backoff_jitter {
            if !(0.0..=1.0).contains(&jitter) {
                return Err(ConfigError::Settings {
                    message: "backoffJitter must be between 0.0 and 1.0".to_string(),
                });
            }
            settings.backoff.jitter_ratio = jitter;
        }

        if let Some(max_failures) = document.max_consecutive_failures {
            if max_failures == 0 {
                return Err(ConfigError::Settings {
                    message: "maxConsecutiveFailures must be at least 1".to_string(),
                });
            }
            settings.max_consecutive_failures = max_failures;
        }

        if let Some(threshold) = document.failure_threshold {
            if threshold == 0 {
                return Err(ConfigError::Settings {
                    message: "failureThreshold must be at least 1".to_string(),
                });
            }
            settings.failure_threshold = threshold;
        }

        if let Some(capacity) = document.log_capacity {
            if capacity == 0 {
                return Err(ConfigError::Settings {
                    message: "logCapacity must be at least 1".to_string(),
                });
            }
            settings.log_capacity = capacity;
        }

        if let Some(path) = document.audit_path.as_deref().filter(|path| !path.trim().is_empty()) {
            settings.audit.path = expand_tilde(path);
        }
        if let Some(max_bytes) = document.audit_max_bytes {
            settings.audit.max_bytes = max_bytes;
        }
        if let Some(max_age_days) = document.audit_max_age_days {
            settings.audit.max_age_days = max_age_days;
        }
        settings.redact_keys = document.redact_keys.clone();

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = EngineSettings::default();
        assert_eq!(settings.health_interval, Duration::from_secs(30));
        assert_eq!(settings.max_consecutive_failures, 3);
        assert_eq!(settings.failure_threshold, 3);
        assert_eq!(settings.log_capacity, 1000);
        assert_eq!(settings.audit.max_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.audit.max_age_days, 7);
        assert_eq!(settings.audit.path.file_name().unwrap(), "plugin-audit.jsonl");
    }

    #[test]
    fn document_overrides_defaults() {
        let document: SettingsDocument = serde_json::from_str(
            r#"{"healthIntervalMs": 250, "maxConsecutiveFailures": 5, "backoffJitter": 0.0, "redactKeys": ["session"]}"#,
        )
        .unwrap();
        let settings = EngineSettings::from_document(Some(&document)).unwrap();
        assert_eq!(settings.health_interval, Duration::from_millis(250));
        assert_eq!(settings.max_consecutive_failures, 5);
        assert_eq!(settings.backoff.jitter_ratio, 0.0);
        assert_eq!(settings.redact_keys, vec!["session".to_string()]);
        assert_eq!(settings.stop_timeout, Duration::from_secs(10));
    }

    #[test]
    fn rejects_degenerate_values() {
        let zero_interval = SettingsDocument {
            health_interval_ms: Some(0),
            ..Default::default()
        };
        assert!(EngineSettings::from_document(Some(&zero_interval)).is_err());

        let inverted = SettingsDocument {
            backoff_base_ms: Some(5_000),
            backoff_max_ms: Some(1_000),
            ..Default::default()
        };
        assert!(EngineSettings::from_document(Some(&inverted)).is_err());

        let jitter = SettingsDocument {
            backoff_jitter: Some(1.5),
            ..Default::default()
        };
        assert!(EngineSettings::from_document(Some(&jitter)).is_err());
    }
}
