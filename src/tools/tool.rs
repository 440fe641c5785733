//! Tool trait and argument validation.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

pub use crate::error::ToolError;

/// Output from a successful tool call.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Human-readable result text.
    pub content: String,
    /// Wall time of the call.
    pub duration: Duration,
}

impl ToolOutput {
    /// Plain text output.
    pub fn text(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            content: content.into(),
            duration,
        }
    }
}

/// Name, description and argument schema of a tool, as advertised to the drafter.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// An action the agent can take.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Action type this tool executes (e.g. `send_email_reply`).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the argument object.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Run the tool. `params` has already passed schema validation.
    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError>;
}

/// Extract a required string parameter.
pub fn require_str<'a>(
    tool: &str,
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("missing '{}' parameter", key),
        })
}

/// Check `args` against the subset of JSON schema our tools declare:
/// object type, `required`, per-property `type`, and
/// `additionalProperties: false`.
pub fn validate_against_schema(
    schema: &serde_json::Value,
    args: &serde_json::Value,
) -> Result<(), String> {
    let Some(obj) = args.as_object() else {
        return Err("arguments must be a JSON object".into());
    };

    let properties = schema.get("properties").and_then(|p| p.as_object());

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            match obj.get(key) {
                None | Some(serde_json::Value::Null) => {
                    return Err(format!("missing required field '{}'", key));
                }
                Some(_) => {}
            }
        }
    }

    let closed = schema
        .get("additionalProperties")
        .and_then(|a| a.as_bool())
        .is_some_and(|allowed| !allowed);

    for (key, value) in obj {
        let declared = properties.and_then(|p| p.get(key));
        match declared {
            Some(prop) => {
                if let Some(expected) = prop.get("type").and_then(|t| t.as_str())
                    && !value.is_null()
                    && !type_matches(expected, value)
                {
                    return Err(format!("field '{}' must be of type {}", key, expected));
                }
            }
            None if closed => return Err(format!("unexpected field '{}'", key)),
            None => {}
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}
