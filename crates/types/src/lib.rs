//! Shared value types used by the Tendril crates.
//!
//! `EnvVar` is the unit used for both process environment overrides and
//! HTTP header values in plugin configuration. The authored template (for
//! example `Bearer ${secret:api.token}`) is what gets serialized; the
//! resolved value lives beside it and is never written or printed.

use std::fmt;
use std::hash::{Hash, Hasher};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Placeholder shown wherever a secret value would otherwise be displayed.
pub const MASKED_VALUE: &str = "••••••••••••••••";

/// A key/value pair whose value may contain credential placeholders.
#[derive(Clone, Serialize, Deserialize, JsonSchema)]
pub struct EnvVar {
    /// Variable or header name.
    pub key: String,

    /// Authored value, possibly containing `${env:NAME}` / `${secret:NAME}`.
    pub value: String,

    /// Where the value ultimately comes from.
    #[serde(default)]
    pub source: EnvSource,

    /// Value after placeholder resolution. Never serialized.
    #[serde(skip)]
    #[schemars(skip)]
    resolved: Option<String>,
}

impl EnvVar {
    /// Create a new environment variable from its authored form.
    pub fn new(key: impl Into<String>, value: impl Into<String>, source: EnvSource) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            source,
            resolved: None,
        }
    }

    /// The value to hand to a child process or request, falling back to the
    /// authored value when no resolution has happened yet.
    pub fn effective_value(&self) -> &str {
        self.resolved.as_deref().unwrap_or(&self.value)
    }

    /// Whether placeholder resolution has run for this variable.
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    /// Record the resolved value.
    pub fn set_resolved(&mut self, value: String) {
        self.resolved = Some(value);
    }

    /// Drop the resolved value, keeping only the authored template.
    pub fn clear_resolved(&mut self) {
        self.resolved = None;
    }

    /// Create a masked version of the environment variable for display.
    pub fn masked(&self) -> Self {
        let value = if self.is_secret() {
            MASKED_VALUE.to_string()
        } else {
            self.value.clone()
        };
        Self {
            key: self.key.clone(),
            value,
            source: self.source,
            resolved: None,
        }
    }

    /// Check if this environment variable carries a secret.
    pub fn is_secret(&self) -> bool {
        matches!(self.source, EnvSource::Secret)
    }
}

impl fmt::Debug for EnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = if self.is_secret() { MASKED_VALUE } else { self.value.as_str() };
        f.debug_struct("EnvVar")
            .field("key", &self.key)
            .field("value", &value)
            .field("source", &self.source)
            .field("resolved", &self.resolved.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// Identity is the key, so an `IndexSet<EnvVar>` holds one value per name.
impl PartialEq for EnvVar {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for EnvVar {}

impl Hash for EnvVar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// Source of an environment variable or header value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EnvSource {
    /// Referenced from a file.
    File,
    /// Stored in the secret store.
    Secret,
    /// Read from the process environment.
    Env,
    /// Literal value written in the configuration.
    #[default]
    Raw,
}

impl fmt::Display for EnvSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvSource::File => write!(f, "file"),
            EnvSource::Secret => write!(f, "secret"),
            EnvSource::Env => write!(f, "env"),
            EnvSource::Raw => write!(f, "raw"),
        }
    }
}
