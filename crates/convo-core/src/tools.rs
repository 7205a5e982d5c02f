//! Provider function-calling schemas derived from Rust argument types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

pub const MAX_TOOL_NAME_LEN: usize = 64;
pub const MAX_TOOL_DESCRIPTION_LEN: usize = 1024;
pub const MAX_TOOLS: usize = 128;
/// Above this many tools models start picking the wrong one.
pub const TOOLS_WARNING_THRESHOLD: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub function: FunctionSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            schema_type: "function".to_string(),
            function: FunctionSchema {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    /// Schema whose parameters are generated from `T`.
    pub fn of<T: JsonSchema>(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, description, schema_for::<T>())
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// JSON schema for `T` with `$schema` and every `title` removed.
pub fn schema_for<T: JsonSchema>() -> Value {
    let mut value = serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
    }
    strip_titles(&mut value);
    value
}

/// Remove `title` keys recursively. A property literally named `title`
/// is kept.
pub fn strip_titles(value: &mut Value) {
    strip_titles_inner(value, "");
}

fn strip_titles_inner(value: &mut Value, parent_key: &str) {
    match value {
        Value::Object(map) => {
            if parent_key != "properties" {
                map.remove("title");
            }
            for (key, child) in map.iter_mut() {
                strip_titles_inner(child, key);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_titles_inner(item, parent_key);
            }
        }
        _ => {}
    }
}

/// Enforce provider limits on a tool set.
pub fn verify_tool_schemas(tools: &[ToolSchema]) -> Result<()> {
    if tools.len() > MAX_TOOLS {
        return Err(CoreError::ToolSchema(format!(
            "{} tools exceed the limit of {}",
            tools.len(),
            MAX_TOOLS
        )));
    }
    if tools.len() >= TOOLS_WARNING_THRESHOLD {
        log::warn!("{} tools offered to the model in one completion", tools.len());
    }

    for tool in tools {
        let name = tool.name();
        if name.is_empty() {
            return Err(CoreError::ToolSchema("tool name cannot be empty".to_string()));
        }
        if name.chars().count() > MAX_TOOL_NAME_LEN {
            return Err(CoreError::ToolSchema(format!(
                "tool name {} exceeds {} characters",
                name, MAX_TOOL_NAME_LEN
            )));
        }
        if tool.function.description.chars().count() > MAX_TOOL_DESCRIPTION_LEN {
            return Err(CoreError::ToolSchema(format!(
                "description of {} exceeds {} characters",
                name, MAX_TOOL_DESCRIPTION_LEN
            )));
        }
    }
    Ok(())
}
