// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

/// Validate a tool input against its JSON schema.
///
/// Covers the subset of JSON Schema the tool definitions actually use:
/// `type`, `required`, per-property `type` and `enum`, and array `items`
/// type checks.  Unknown schema keywords are ignored rather than rejected
/// so MCP servers with richer schemas still validate on the common core.
pub fn validate_against_schema(input: &Value, schema: &Value) -> Result<(), String> {
    check_value(input, schema, "input")
}

fn check_value(value: &Value, schema: &Value, path: &str) -> Result<(), String> {
    if let Some(expected) = schema["type"].as_str() {
        if !type_matches(value, expected) {
            return Err(format!(
                "{path}: expected {expected}, got {}",
                type_name(value)
            ));
        }
    }

    if let Some(allowed) = schema["enum"].as_array() {
        if !allowed.contains(value) {
            return Err(format!(
                "{path}: value {value} is not one of the allowed values"
            ));
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema["required"].as_array() {
            for field in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(field) {
                    return Err(format!("{path}: missing required field '{field}'"));
                }
            }
        }
        if let Some(props) = schema["properties"].as_object() {
            for (key, subschema) in props {
                if let Some(sub) = obj.get(key) {
                    check_value(sub, subschema, &format!("{path}.{key}"))?;
                }
            }
        }
    }

    if let Some(items) = value.as_array() {
        let item_schema = &schema["items"];
        if item_schema.is_object() {
            for (i, item) in items.iter().enumerate() {
                check_value(item, item_schema, &format!("{path}[{i}]"))?;
            }
        }
    }

    Ok(())
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
