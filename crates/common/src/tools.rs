//! Tool schemas and tool-invocation records.
//!
//! The schema wire shape is consumed by model-calling code and must stay
//! stable:
//!
//! ```json
//! {"name": "...", "description": "...",
//!  "parameters": {"type": "object",
//!                 "properties": {"<arg>": {"type": "...", "description": "..."}},
//!                 "required": ["<arg>"]}}
//! ```

use std::collections::BTreeMap;

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

use crate::error::{Error, Result};

// ── Schema ──────────────────────────────────────────────────────────────────

/// Declared tool, as exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

/// Structural description of accepted arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self {
            kind: "object".into(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    /// Extra JSON-schema keywords (`enum`, `items`, ...), passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One argument in builder form.
#[derive(Debug, Clone)]
pub struct ToolParameter {
    pub name: String,
    pub kind: String,
    pub description: String,
    pub required: bool,
}

impl ToolParameter {
    pub fn required(
        name: impl Into<String>,
        kind: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        kind: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: ParameterSchema::default(),
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        if param.required && !self.parameters.required.contains(&param.name) {
            self.parameters.required.push(param.name.clone());
        }
        self.parameters.properties.insert(param.name, PropertySchema {
            kind: param.kind,
            description: param.description,
            extra: Map::new(),
        });
        self
    }

    /// Parse a schema from JSON. Accepts the plain shape above as well as the
    /// OpenAI `{"type": "function", "function": {...}}` envelope.
    pub fn from_value(value: Value) -> Result<Self> {
        let inner = match value {
            Value::Object(mut map)
                if map.get("type").and_then(Value::as_str) == Some("function")
                    && map.contains_key("function") =>
            {
                map.remove("function").unwrap_or(Value::Null)
            },
            other => other,
        };
        let schema: ToolSchema = serde_json::from_value(inner)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_tool_schema(&self.name, "empty tool name"));
        }
        if self.parameters.kind != "object" {
            return Err(Error::invalid_tool_schema(
                &self.name,
                format!("parameters type must be `object`, got `{}`", self.parameters.kind),
            ));
        }
        if let Some(missing) = self
            .parameters
            .required
            .iter()
            .find(|r| !self.parameters.properties.contains_key(*r))
        {
            return Err(Error::invalid_tool_schema(
                &self.name,
                format!("required parameter `{missing}` has no property"),
            ));
        }
        Ok(())
    }
}

// ── Invocation ──────────────────────────────────────────────────────────────

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            arguments,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { result: Value },
    Failed { error: String },
    TimedOut { after_ms: u64 },
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Entry in a message's tool trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub tool: String,
    pub arguments: Value,
    pub outcome: ToolOutcome,
    pub at: DateTime<Utc>,
}
