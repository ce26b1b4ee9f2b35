//! Tool metadata and tool call results as exchanged with plugins.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool advertised by a plugin in its `tools/list` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Tool identifier.
    pub name: String,
    /// Optional human-friendly title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Optional description of the tool's behavior.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the arguments.
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
    /// JSON schema for structured output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Behavior hints such as `readOnlyHint`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
    /// Free-form metadata (for example `cacheTtlSeconds`).
    #[serde(default, rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl ToolDescriptor {
    /// Minimal descriptor with just a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: None,
            input_schema: empty_object_schema(),
            output_schema: None,
            annotations: None,
            meta: None,
        }
    }

    /// Boolean annotation lookup.
    pub fn annotation_flag(&self, key: &str) -> bool {
        self.annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Result of a `tools/call` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    /// Content blocks (text, images, resources).
    #[serde(default)]
    pub content: Vec<Value>,
    /// Machine-readable result, when the tool provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    /// Tool-level failure flag.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    /// Concatenated text of all `text` content blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_parses_wire_shape() {
        let tool: ToolDescriptor = serde_json::from_value(json!({
            "name": "list_repos",
            "description": "List repositories",
            "inputSchema": {"type": "object", "properties": {"owner": {"type": "string"}}},
            "annotations": {"readOnlyHint": true},
            "_meta": {"cacheTtlSeconds": 30}
        }))
        .unwrap();

        assert_eq!(tool.name, "list_repos");
        assert!(tool.annotation_flag("readOnlyHint"));
        assert!(!tool.annotation_flag("destructiveHint"));
        assert_eq!(tool.meta.unwrap()["cacheTtlSeconds"], json!(30));
    }

    #[test]
    fn descriptor_defaults_missing_schema() {
        let tool: ToolDescriptor = serde_json::from_value(json!({"name": "ping"})).unwrap();
        assert_eq!(tool.input_schema, json!({"type": "object"}));
    }

    #[test]
    fn output_text_joins_text_blocks() {
        let output: ToolOutput = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "a"}, {"type": "image", "data": "x"}, {"type": "text", "text": "b"}]
        }))
        .unwrap();
        assert_eq!(output.text(), "a\nb");
        assert!(!output.is_error);
    }
}
