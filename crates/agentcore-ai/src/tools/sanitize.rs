//! Tool schema sanitization for providers that only accept a JSON Schema
//! subset.
//!
//! [`sanitize_schema`] is pure and idempotent: sanitizing an already
//! sanitized schema returns it unchanged.

use serde_json::{Map, Value, json};

const BRANCH_KEYWORDS: [&str; 2] = ["anyOf", "oneOf"];
const CONDITIONAL_KEYWORDS: [&str; 3] = ["if", "then", "else"];

pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(sanitize_node(map.clone())),
        other => other.clone(),
    }
}

fn sanitize_node(node: Map<String, Value>) -> Map<String, Value> {
    let mut node = fold_combinators(node);
    collapse_nullable_type(&mut node);

    if let Some(Value::Object(properties)) = node.get_mut("properties") {
        for value in properties.values_mut() {
            *value = sanitize_schema(value);
        }
    }
    if let Some(additional) = node.get_mut("additionalProperties")
        && additional.is_object()
    {
        *additional = sanitize_schema(additional);
    }

    match node.get("type").and_then(Value::as_str) {
        Some("object") => {
            if !node.get("properties").is_some_and(Value::is_object) {
                node.insert("properties".to_string(), json!({}));
            }
        }
        Some("array") => {
            let items = match node.remove("items") {
                Some(Value::Object(items)) => Value::Object(sanitize_node(items)),
                // Tuple form keeps the first item's shape
                Some(Value::Array(items)) => items
                    .into_iter()
                    .find(Value::is_object)
                    .map(|item| sanitize_schema(&item))
                    .unwrap_or_else(default_items),
                _ => default_items(),
            };
            node.insert("items".to_string(), items);
        }
        _ => {}
    }

    node
}

fn default_items() -> Value {
    json!({"type": "string"})
}

/// Replace combinators by the shape they describe, until none are left.
fn fold_combinators(mut node: Map<String, Value>) -> Map<String, Value> {
    loop {
        let mut changed = false;

        for key in CONDITIONAL_KEYWORDS {
            changed |= node.remove(key).is_some();
        }

        if let Some(all_of) = node.remove("allOf") {
            changed = true;
            if let Value::Array(branches) = all_of {
                for branch in branches {
                    if let Value::Object(branch) = branch {
                        merge_missing(&mut node, branch);
                    }
                }
            }
        }

        for key in BRANCH_KEYWORDS {
            let Some(branches) = node.remove(key) else {
                continue;
            };
            changed = true;
            if let Value::Array(branches) = branches
                && let Some(Value::Object(branch)) =
                    branches.into_iter().find(|branch| !is_null_schema(branch))
            {
                merge_missing(&mut node, branch);
            }
        }

        if !changed {
            return node;
        }
    }
}

/// Copy keys of `branch` absent from `node`; `properties` and `required`
/// are unioned.
fn merge_missing(node: &mut Map<String, Value>, branch: Map<String, Value>) {
    for (key, value) in branch {
        match node.get_mut(&key) {
            Some(Value::Object(existing)) if key == "properties" => {
                if let Value::Object(incoming) = value {
                    for (name, schema) in incoming {
                        existing.entry(name).or_insert(schema);
                    }
                }
            }
            Some(Value::Array(existing)) if key == "required" => {
                if let Value::Array(incoming) = value {
                    for name in incoming {
                        if !existing.contains(&name) {
                            existing.push(name);
                        }
                    }
                }
            }
            Some(_) => {}
            None => {
                node.insert(key, value);
            }
        }
    }
}

fn is_null_schema(schema: &Value) -> bool {
    match schema.get("type") {
        Some(Value::String(kind)) => kind == "null",
        Some(Value::Array(kinds)) => kinds.iter().all(|kind| kind == "null"),
        _ => false,
    }
}

/// `type: [X, "null"]` becomes `type: X`.
fn collapse_nullable_type(node: &mut Map<String, Value>) {
    let Some(Value::Array(kinds)) = node.get("type") else {
        return;
    };
    let collapsed = kinds
        .iter()
        .filter_map(Value::as_str)
        .find(|kind| *kind != "null")
        .unwrap_or("string")
        .to_string();
    node.insert("type".to_string(), Value::String(collapsed));
}
