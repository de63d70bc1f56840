use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedMemoryRequirement {
    pub min_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_bytes: Option<u64>,
}

impl SharedMemoryRequirement {
    /// Bytes to allocate: an explicit hint wins, then the preferred size, then
    /// the minimum. Never less than `min_bytes`.
    pub fn requested_bytes(&self, hint: Option<u64>) -> u64 {
        hint.or(self.preferred_bytes)
            .unwrap_or(self.min_bytes)
            .max(self.min_bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDescriptor {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub parameter_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_memory: Option<SharedMemoryRequirement>,
    #[serde(default)]
    pub supports_multiple_sessions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_format: Option<String>,
}

impl CapabilityDescriptor {
    pub fn data_format(&self) -> &str {
        self.data_format.as_deref().unwrap_or("binary")
    }
}

/// Check connection parameters against the small JSON-schema subset
/// capabilities declare: `type`, `required` and per-property primitive `type`.
/// A null or empty schema accepts anything.
pub fn validate_parameters(schema: &Value, parameters: &Value) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };
    if schema.is_empty() {
        return Ok(());
    }

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !matches_type(expected, parameters) {
            return Err(format!("parameters must be of type {}", expected));
        }
    }

    let Some(object) = parameters.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) {
                return Err(format!("missing required parameter '{}'", name));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, value) in object {
            let Some(expected) = properties
                .get(name)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if !matches_type(expected, value) {
                return Err(format!("parameter '{}' must be of type {}", name, expected));
            }
        }
    }

    Ok(())
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "null" => value.is_null(),
        _ => true,
    }
}
