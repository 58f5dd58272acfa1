use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// One entry of the external tool catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        let input_schema = if input_schema.is_object() {
            input_schema
        } else {
            empty_object_schema()
        };
        let parameters = flatten_parameters(&input_schema);
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            parameters,
        }
    }

    /// Parses one row of an MCP `tools/list` result. Rows without a name are skipped.
    pub fn from_mcp_row(row: &Value) -> Option<Self> {
        let name = row.get("name").and_then(|v| v.as_str())?;
        let description = row
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let schema = row
            .get("inputSchema")
            .or_else(|| row.get("input_schema"))
            .cloned()
            .unwrap_or_else(empty_object_schema);
        Some(Self::new(name, description, schema))
    }
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

fn flatten_parameters(schema: &Value) -> Vec<ToolParameter> {
    let required = schema
        .get("required")
        .and_then(|v| v.as_array())
        .map(|rows| rows.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>())
        .unwrap_or_default();
    let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) else {
        return Vec::new();
    };
    let mut out = properties
        .iter()
        .map(|(name, prop)| ToolParameter {
            name: name.clone(),
            kind: prop
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("string")
                .to_string(),
            description: prop
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            required: required.contains(&name.as_str()),
        })
        .collect::<Vec<_>>();
    out.sort_by(|a, b| b.required.cmp(&a.required).then(a.name.cmp(&b.name)));
    out
}
