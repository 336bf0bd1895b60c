use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-schema description of a tool, as advertised by the Tool Registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl ToolResult {
    pub fn text(output: impl Into<Value>) -> Self {
        Self {
            output: output.into(),
            metadata: Value::Null,
        }
    }
}
