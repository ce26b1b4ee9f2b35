//! Provider contracts derived from advertised tools.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ToolDescriptor;

/// TTL hint for tools annotated as read-only without an explicit TTL.
const READ_ONLY_TTL: Duration = Duration::from_secs(60);

/// Generic description of one plugin tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderContract {
    pub plugin: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub inputs: Vec<InputParameter>,
    pub output: OutputShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// What a tool returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum OutputShape {
    /// Structured output with named fields.
    Fields { fields: Vec<OutputField> },
    /// Free-form content blocks.
    Content,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ProviderContract {
    pub fn from_tool(plugin: &str, tool: &ToolDescriptor) -> Self {
        let required: Vec<&str> = tool
            .input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let inputs = properties(&tool.input_schema)
            .map(|(name, schema)| InputParameter {
                name: name.clone(),
                kind: schema_type(schema),
                required: required.contains(&name.as_str()),
                description: schema.get("description").and_then(Value::as_str).map(str::to_string),
            })
            .collect();

        let output = match &tool.output_schema {
            Some(schema) if schema.get("properties").is_some_and(Value::is_object) => OutputShape::Fields {
                fields: properties(schema)
                    .map(|(name, schema)| OutputField {
                        name: name.clone(),
                        kind: schema_type(schema),
                    })
                    .collect(),
            },
            _ => OutputShape::Content,
        };

        let explicit_ttl = tool
            .meta
            .as_ref()
            .and_then(|meta| meta.get("cacheTtlSeconds"))
            .and_then(Value::as_u64)
            .map(Duration::from_secs);
        let cache_ttl = explicit_ttl.or_else(|| tool.annotation_flag("readOnlyHint").then_some(READ_ONLY_TTL));

        Self {
            plugin: plugin.to_string(),
            tool: tool.name.clone(),
            description: tool.description.clone().or_else(|| tool.title.clone()),
            inputs,
            output,
            cache_ttl,
        }
    }

    /// `plugin:tool`.
    pub fn id(&self) -> String {
        provider_id(&self.plugin, &self.tool)
    }
}

pub fn provider_id(plugin: &str, tool: &str) -> String {
    format!("{plugin}:{tool}")
}

/// Split a `plugin:tool` id.
pub fn split_provider_id(id: &str) -> Option<(&str, &str)> {
    id.split_once(':').filter(|(plugin, tool)| !plugin.is_empty() && !tool.is_empty())
}

fn properties(schema: &Value) -> impl Iterator<Item = (&String, &Value)> {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|properties| properties.iter())
}

fn schema_type(schema: &Value) -> String {
    match schema.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(Value::Array(kinds)) => kinds
            .iter()
            .find_map(Value::as_str)
            .unwrap_or("any")
            .to_string(),
        _ => "any".to_string(),
    }
}
