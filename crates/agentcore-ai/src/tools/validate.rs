//! Argument coercion and validation against a tool's parameter schema.

use serde_json::{Map, Value};

/// Convert a textual parameter (as written in an XML tool call) to the
/// JSON type the property schema declares. Values that do not parse stay
/// strings and are reported later by [`validate_arguments`].
pub fn coerce_parameter(property: Option<&Value>, raw: &str) -> Value {
    let declared = property.map(declared_types).unwrap_or_default();
    let trimmed = raw.trim();

    for kind in &declared {
        let coerced = match kind.as_str() {
            "integer" => trimmed.parse::<i64>().ok().map(Value::from),
            "number" => trimmed
                .parse::<i64>()
                .ok()
                .map(Value::from)
                .or_else(|| trimmed.parse::<f64>().ok().map(Value::from)),
            "boolean" => match trimmed.to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            "array" => serde_json::from_str::<Value>(trimmed)
                .ok()
                .filter(Value::is_array),
            "object" => serde_json::from_str::<Value>(trimmed)
                .ok()
                .filter(Value::is_object),
            "string" => return Value::String(raw.to_string()),
            _ => None,
        };
        if let Some(value) = coerced {
            return value;
        }
    }

    Value::String(raw.to_string())
}

/// Coerce every textual parameter of a call using the tool's schema.
pub fn coerce_arguments(schema: &Value, raw: Vec<(String, String)>) -> Value {
    let properties = schema.get("properties");
    let mut arguments = Map::new();
    for (name, text) in raw {
        let property = properties.and_then(|props| props.get(&name));
        arguments.insert(name, coerce_parameter(property, &text));
    }
    Value::Object(arguments)
}

/// Check required parameters, declared primitive types and enums.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    let Some(arguments) = arguments.as_object() else {
        return Err(format!("arguments must be an object, got {arguments}"));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|name| arguments.get(*name).is_none_or(Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required parameter(s): {}", missing.join(", ")));
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (name, value) in arguments {
        let Some(property) = properties.and_then(|props| props.get(name)) else {
            if closed {
                return Err(format!("unexpected parameter '{name}'"));
            }
            continue;
        };

        let declared = declared_types(property);
        if !declared.is_empty() && !declared.iter().any(|kind| matches_type(kind, value)) {
            return Err(format!(
                "parameter '{name}' must be of type {}, got {}",
                declared.join(" or "),
                type_name(value)
            ));
        }

        if let Some(allowed) = property.get("enum").and_then(Value::as_array)
            && !allowed.contains(value)
        {
            return Err(format!("parameter '{name}' must be one of {}", Value::Array(allowed.clone())));
        }
    }

    Ok(())
}

fn declared_types(property: &Value) -> Vec<String> {
    match property.get("type") {
        Some(Value::String(kind)) => vec![kind.clone()],
        Some(Value::Array(kinds)) => kinds
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn matches_type(kind: &str, value: &Value) -> bool {
    match kind {
        "string" => value.is_string(),
        "integer" => {
            value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|n| n.fract() == 0.0)
        }
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
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
