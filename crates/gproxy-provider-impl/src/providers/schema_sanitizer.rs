//! Recursively strips every JSON-Schema keyword Gemini's
//! `functionDeclarations.parameters` does not accept (§4.6.3). Applied to
//! each tool's `input_schema` before it is sent upstream.

use serde_json::{Map, Value};

const WHITELIST: &[&str] = &[
    "type",
    "properties",
    "required",
    "description",
    "enum",
    "items",
    "format",
    "nullable",
    "title",
    "anyOf",
    "$ref",
    "$defs",
    "$id",
    "$anchor",
    "minimum",
    "maximum",
    "minItems",
    "maxItems",
    "prefixItems",
    "additionalProperties",
    "propertyOrdering",
];

/// Sanitizes a whole schema node. `properties` is special: every
/// immediate child key there is a user-defined property name (never
/// whitelist-filtered), but its value is sanitized recursively like any
/// other node.
pub fn sanitize(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if key == "properties" {
                    if let Value::Object(props) = value {
                        let mut sanitized_props = Map::new();
                        for (prop_name, prop_schema) in props {
                            sanitized_props.insert(prop_name.clone(), sanitize(prop_schema));
                        }
                        out.insert(key.clone(), Value::Object(sanitized_props));
                    }
                    continue;
                }
                if !WHITELIST.contains(&key.as_str()) {
                    continue;
                }
                out.insert(key.clone(), sanitize_value(value));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Object(_) => sanitize(value),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drops_non_whitelisted_keys_but_keeps_known_ones() {
        let schema = json!({
            "type": "object",
            "properties": {
                "x": {"type": "string", "examples": ["a"], "pattern": "."}
            },
            "additionalProperties": false,
            "$schema": "http://json-schema.org/draft-07/schema#",
        });
        let sanitized = sanitize(&schema);
        assert_eq!(sanitized["type"], "object");
        assert_eq!(sanitized["additionalProperties"], false);
        assert!(sanitized.get("$schema").is_none());
        assert!(sanitized["properties"]["x"].get("examples").is_none());
        assert!(sanitized["properties"]["x"].get("pattern").is_none());
        assert_eq!(sanitized["properties"]["x"]["type"], "string");
    }

    #[test]
    fn property_names_are_never_filtered_even_if_they_collide_with_keywords() {
        let schema = json!({
            "type": "object",
            "properties": {
                "enum": {"type": "string"},
                "required": {"type": "boolean"},
            },
        });
        let sanitized = sanitize(&schema);
        assert!(sanitized["properties"].get("enum").is_some());
        assert!(sanitized["properties"].get("required").is_some());
    }

    #[test]
    fn recurses_into_arrays_and_nested_objects() {
        let schema = json!({
            "type": "array",
            "items": {"type": "object", "properties": {"y": {"type": "number", "examples": [1]}}}
        });
        let sanitized = sanitize(&schema);
        assert!(sanitized["items"]["properties"]["y"].get("examples").is_none());
        assert_eq!(sanitized["items"]["properties"]["y"]["type"], "number");
    }
}
