use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::*;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

impl ListToolsResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CallToolResult {
    pub content: Vec<Content>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(rename = "structuredContent", skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text_content(mut self, text: impl Into<String>) -> Self {
        self.content.push(Content::text(text));
        self
    }

    pub fn is_error(mut self, is_error: bool) -> Self {
        self.is_error = Some(is_error);
        self
    }

    pub fn with_structured_content(mut self, content: Value) -> Self {
        self.structured_content = Some(content);
        self
    }

    /// A tool-level failure the model can read and react to.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new().with_text_content(message).is_error(true)
    }

    pub fn failed(&self) -> bool {
        self.is_error.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolAnnotations {
    #[serde(rename = "readOnlyHint", skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    #[serde(rename = "destructiveHint", skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    #[serde(rename = "idempotentHint", skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: ToolInputSchema,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
}

impl Tool {
    pub fn new(name: impl Into<String>, input_schema: ToolInputSchema) -> Self {
        Self {
            name: name.into(),
            input_schema,
            description: None,
            annotations: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_read_only_hint(mut self, read_only: bool) -> Self {
        self.annotations
            .get_or_insert_with(Default::default)
            .read_only_hint = Some(read_only);
        self
    }

    pub fn with_idempotent_hint(mut self, idempotent: bool) -> Self {
        self.annotations
            .get_or_insert_with(Default::default)
            .idempotent_hint = Some(idempotent);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInputSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(rename = "additionalProperties", skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
}

impl ToolInputSchema {
    /// Derive the wire schema from a `schemars` description of the argument struct.
    pub fn from_json_schema<T: schemars::JsonSchema>() -> Self {
        let schema = schemars::schema_for!(T);
        let schema_obj = schema.as_value().as_object();
        let field = |name: &str| schema_obj.and_then(|obj| obj.get(name));

        let schema_type = field("type")
            .and_then(|v| v.as_str())
            .unwrap_or("object")
            .to_string();
        let defs = field("$defs").and_then(|v| v.as_object());
        let properties = field("properties").and_then(|v| v.as_object()).map(|props| {
            props
                .iter()
                .map(|(k, v)| (k.clone(), inline_ref(v, defs)))
                .collect::<HashMap<_, _>>()
        });
        let required = field("required").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect::<Vec<_>>()
        });
        let additional_properties = field("additionalProperties").and_then(|v| v.as_bool());
        Self {
            schema_type,
            properties,
            required,
            additional_properties,
        }
    }
}

/// Replace a local `$ref` with the definition it points to, so clients that
/// only read `properties` still see enum values.
fn inline_ref(property: &Value, defs: Option<&serde_json::Map<String, Value>>) -> Value {
    let target = property
        .get("$ref")
        .and_then(Value::as_str)
        .and_then(|r| r.strip_prefix("#/$defs/"))
        .and_then(|name| defs?.get(name));
    let Some(Value::Object(definition)) = target else {
        return property.clone();
    };
    let mut inlined = definition.clone();
    if let Value::Object(extra) = property {
        for (k, v) in extra {
            if k != "$ref" {
                inlined.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(inlined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    #[serde(deny_unknown_fields)]
    struct SampleArgs {
        /// Issue to look up.
        issue_id: String,
        limit: Option<u32>,
    }

    #[test]
    fn test_schema_from_struct() {
        let schema = ToolInputSchema::from_json_schema::<SampleArgs>();
        assert_eq!(schema.schema_type, "object");
        let props = schema.properties.unwrap();
        assert!(props.contains_key("issue_id"));
        assert!(props.contains_key("limit"));
        assert_eq!(schema.required, Some(vec!["issue_id".to_string()]));
        assert_eq!(schema.additional_properties, Some(false));
    }

    #[test]
    fn test_error_result() {
        let result = CallToolResult::error("issue not found");
        assert!(result.failed());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["isError"], true);
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][0]["text"], "issue not found");
    }
}
