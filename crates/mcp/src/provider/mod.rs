//! Provider bridge: plugin tools exposed as generic value providers.

mod contract;

pub use contract::{InputParameter, OutputField, OutputShape, ProviderContract, provider_id, split_provider_id};

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::client::ManagedClient;
use crate::types::{InvokeError, ToolError, ToolOutput};

/// Errors a provider consumer can act on, independent of the transport.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider '{provider}' is unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("provider '{provider}' rejected the request: {reason}")]
    Rejected { provider: String, reason: String },

    #[error("provider '{provider}' is not authorized")]
    Unauthorized { provider: String },

    #[error("provider '{provider}' does not exist")]
    UnknownTool { provider: String },
}

impl ProviderError {
    pub(crate) fn from_invoke(provider: String, error: InvokeError) -> Self {
        match error {
            InvokeError::Auth(_) => Self::Unauthorized { provider },
            InvokeError::Tool(ToolError::NotFound { .. }) => Self::UnknownTool { provider },
            InvokeError::Tool(other) => Self::Rejected {
                provider,
                reason: other.to_string(),
            },
            InvokeError::Transport(transport) => Self::Unavailable {
                provider,
                reason: transport.to_string(),
            },
        }
    }
}

/// Host-facing source of values backed by plugin tools.
#[async_trait]
pub trait ValueProvider: Send + Sync {
    async fn fetch_values(&self, provider_id: &str, arguments: &Map<String, Value>) -> Result<Vec<Value>, ProviderError>;

    fn contract(&self, provider_id: &str) -> Option<ProviderContract>;

    fn provider_ids(&self) -> Vec<String>;
}

/// Contracts of every connected plugin, in configuration order.
#[derive(Debug, Default)]
pub struct ProviderBridge {
    contracts: RwLock<IndexMap<String, Vec<ProviderContract>>>,
}

impl ProviderBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the contracts of `plugin` from its tool list.
    pub async fn refresh(&self, plugin: &str, client: &ManagedClient) -> Result<usize, InvokeError> {
        let tools = client.list_capabilities().await?;
        let contracts: Vec<ProviderContract> = tools
            .iter()
            .map(|tool| ProviderContract::from_tool(plugin, tool))
            .collect();
        let count = contracts.len();
        self.contracts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin.to_string(), contracts);
        debug!(plugin = %plugin, count, "provider contracts refreshed");
        Ok(count)
    }

    pub fn forget(&self, plugin: &str) {
        self.contracts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(plugin);
    }

    pub fn retain_plugins(&self, keep: impl Fn(&str) -> bool) {
        self.contracts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|plugin, _| keep(plugin));
    }

    pub fn contracts(&self) -> Vec<ProviderContract> {
        self.contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn plugin_contracts(&self, plugin: &str) -> Vec<ProviderContract> {
        self.contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contract(&self, plugin: &str, tool: &str) -> Option<ProviderContract> {
        self.contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin)
            .and_then(|contracts| contracts.iter().find(|contract| contract.tool == tool).cloned())
    }

    /// Invoke `tool` through `client` and extract its values.
    pub async fn fetch(&self, client: &ManagedClient, tool: &str, arguments: Value) -> Result<Vec<Value>, ProviderError> {
        let provider = provider_id(client.name(), tool);
        let output = client
            .invoke(tool, arguments)
            .await
            .map_err(|error| ProviderError::from_invoke(provider, error))?;
        Ok(extract_values(&output))
    }
}

/// Values of a tool result: structured content first, then JSON text blocks,
/// then the raw content entries.
pub fn extract_values(output: &ToolOutput) -> Vec<Value> {
    if let Some(structured) = &output.structured_content {
        return flatten(structured.clone());
    }

    let parsed: Vec<Value> = output
        .content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .filter_map(|text| serde_json::from_str::<Value>(text).ok())
        .flat_map(flatten)
        .collect();
    if !parsed.is_empty() {
        return parsed;
    }

    output.content.clone()
}

fn flatten(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut object) => {
            for key in ["items", "results"] {
                if object.get(key).is_some_and(Value::is_array)
                    && let Some(Value::Array(items)) = object.remove(key)
                {
                    return items;
                }
            }
            vec![Value::Object(object)]
        }
        other => vec![other],
    }
}
