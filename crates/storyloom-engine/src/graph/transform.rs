use serde_json::Value;

use storyloom_core::error::{LoomError, Result};
use storyloom_core::types::{CombineMode, Transform};

use super::resolve::{lookup_path, value_to_text, ResolvedInput};

const DEFAULT_SEPARATOR: &str = "\n\n";

/// Run a data transform over the resolved input. No external calls.
pub fn apply_transform(node_id: &str, transform: &Transform, input: &ResolvedInput) -> Result<Value> {
    match transform {
        Transform::Merge => {
            let mut merged = serde_json::Map::new();
            for (slot, value) in &input.values {
                match value {
                    Value::Object(map) => {
                        for (k, v) in map {
                            merged.insert(k.clone(), v.clone());
                        }
                    }
                    other => {
                        return Err(failure(
                            node_id,
                            format!("merge expects objects, slot '{}' holds {}", slot, kind_of(other)),
                        ))
                    }
                }
            }
            Ok(Value::Object(merged))
        }
        Transform::Concat => {
            let mut items = Vec::new();
            for (_, value) in &input.values {
                match value {
                    Value::Array(values) => items.extend(values.iter().cloned()),
                    other => items.push(other.clone()),
                }
            }
            Ok(Value::Array(items))
        }
        Transform::Pick { path } => {
            let found = match input.values.as_slice() {
                [(_, only)] => lookup_path(only, path),
                _ => {
                    // With several slots the first segment names the slot.
                    let (slot, rest) = path.split_once('.').unwrap_or((path.as_str(), ""));
                    input.get(slot).and_then(|v| lookup_path(v, rest))
                }
            };
            found
                .cloned()
                .ok_or_else(|| failure(node_id, format!("path '{}' not found in input", path)))
        }
        Transform::Format { .. } => input
            .prompt
            .clone()
            .map(Value::String)
            .ok_or_else(|| failure(node_id, "format template was not rendered".into())),
    }
}

/// Aggregate all slots of a combine node.
pub fn combine(mode: CombineMode, separator: Option<&str>, input: &ResolvedInput) -> Value {
    match mode {
        CombineMode::Object => Value::Object(input.to_map()),
        CombineMode::Array => Value::Array(input.values.iter().map(|(_, v)| v.clone()).collect()),
        CombineMode::Text => {
            let parts: Vec<String> = input
                .values
                .iter()
                .flat_map(|(_, v)| match v {
                    Value::Array(items) => items.iter().map(value_to_text).collect(),
                    other => vec![value_to_text(other)],
                })
                .collect();
            Value::String(parts.join(separator.unwrap_or(DEFAULT_SEPARATOR)))
        }
    }
}

fn failure(node_id: &str, message: String) -> LoomError {
    LoomError::NodeExecution {
        node_id: node_id.to_string(),
        message,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
