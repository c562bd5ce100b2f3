// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-schema sanitization for the upstream's restricted schema dialect.
//!
//! The upstream accepts only a small subset of JSON Schema: uppercase
//! primitive type names, `properties`/`required`/`items`/`enum`, and a
//! free-form `description`.  Everything else — `$ref`, `allOf`,
//! `anyOf`/`oneOf`, type arrays, string constraints — must be flattened
//! or folded into the description before the declaration leaves the
//! process.  The transformation is idempotent so replayed histories can
//! be sanitized again without drift.

use serde_json::{json, Map, Value};

/// Constraint keywords the upstream rejects; their values are folded
/// into the description instead of being dropped silently.
const FOLDED_CONSTRAINTS: &[&str] = &[
    "minLength",
    "maxLength",
    "pattern",
    "format",
    "examples",
    "default",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    "uniqueItems",
    "minProperties",
    "maxProperties",
    "minItems",
    "maxItems",
];

/// Normalise a tool name to `[A-Za-z0-9_-]{1,64}`.
pub fn sanitize_tool_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(64)
        .collect();
    if out.is_empty() {
        out.push_str("tool");
    }
    out
}

/// Sanitize a JSON-schema tree in place and return it.
///
/// `sanitize_schema(sanitize_schema(s)) == sanitize_schema(s)`.
pub fn sanitize_schema(schema: Value) -> Value {
    match schema {
        Value::Object(map) => sanitize_object(map),
        other => other,
    }
}

fn sanitize_object(mut map: Map<String, Value>) -> Value {
    // $ref cannot be resolved here; replace with an opaque object and
    // keep the target as a hint for the model.
    if let Some(reference) = map.get("$ref").and_then(Value::as_str).map(str::to_string) {
        return json!({
            "type": "OBJECT",
            "description": format!("Reference to {reference}"),
        });
    }

    // allOf: merge every branch into one object schema.
    if let Some(Value::Array(branches)) = map.remove("allOf") {
        let mut merged = map;
        for branch in branches {
            if let Value::Object(branch) = branch {
                merge_schema_into(&mut merged, branch);
            }
        }
        return sanitize_object(merged);
    }

    // anyOf / oneOf: the dialect has no unions, so pick the structurally
    // richest alternative and record the rest in the description.
    for union_key in ["anyOf", "oneOf"] {
        if let Some(Value::Array(alternatives)) = map.remove(union_key) {
            return flatten_union(map, alternatives);
        }
    }

    // Type arrays: take the first non-null entry.
    if let Some(Value::Array(types)) = map.get("type").cloned() {
        let first = types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| !t.eq_ignore_ascii_case("null"))
            .unwrap_or("string")
            .to_string();
        map.insert("type".into(), Value::String(first));
    }

    // const → single-element enum.
    if let Some(constant) = map.remove("const") {
        map.insert("enum".into(), Value::Array(vec![constant]));
    }

    // Fold unsupported constraints into the description.
    let mut notes = Vec::new();
    for key in FOLDED_CONSTRAINTS {
        if let Some(v) = map.remove(*key) {
            notes.push(format!("{key}={}", terse(&v)));
        }
    }
    if !notes.is_empty() {
        append_description(&mut map, &format!("Constraints: {}", notes.join(", ")));
    }

    // Uppercase the primitive type name.
    if let Some(t) = map.get("type").and_then(Value::as_str) {
        let upper = t.to_ascii_uppercase();
        map.insert("type".into(), Value::String(upper));
    }

    // Recurse into child schemas.
    if let Some(Value::Object(props)) = map.remove("properties") {
        let sanitized: Map<String, Value> =
            props.into_iter().map(|(k, v)| (k, sanitize_schema(v))).collect();
        map.insert("properties".into(), Value::Object(sanitized));
    }
    if let Some(items) = map.remove("items") {
        map.insert("items".into(), sanitize_schema(items));
    }
    if let Some(additional) = map.remove("additionalProperties") {
        // Boolean additionalProperties is meaningless to the upstream.
        if additional.is_object() {
            map.insert("additionalProperties".into(), sanitize_schema(additional));
        }
    }

    Value::Object(map)
}

/// Merge `src` into `dst` for allOf flattening: properties and required
/// are unioned, scalar keys keep the first value seen.
fn merge_schema_into(dst: &mut Map<String, Value>, src: Map<String, Value>) {
    for (key, value) in src {
        match key.as_str() {
            "properties" => {
                let entry = dst
                    .entry("properties")
                    .or_insert_with(|| Value::Object(Map::new()));
                if let (Value::Object(d), Value::Object(s)) = (entry, value) {
                    for (pk, pv) in s {
                        d.entry(pk).or_insert(pv);
                    }
                }
            }
            "required" => {
                let entry = dst.entry("required").or_insert_with(|| Value::Array(vec![]));
                if let (Value::Array(d), Value::Array(s)) = (entry, value) {
                    for item in s {
                        if !d.contains(&item) {
                            d.push(item);
                        }
                    }
                }
            }
            _ => {
                dst.entry(key).or_insert(value);
            }
        }
    }
}

/// Structural rank used to pick a union winner: objects carry the most
/// information, then arrays, then primitives.
fn rank(schema: &Value) -> u8 {
    match schema.get("type").and_then(Value::as_str).map(str::to_ascii_lowercase).as_deref() {
        Some("object") => 3,
        Some("array") => 2,
        Some(_) => 1,
        // No explicit type: treat a schema with properties as an object.
        None if schema.get("properties").is_some() => 3,
        None => 1,
    }
}

fn type_label(schema: &Value) -> String {
    schema
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| {
            if schema.get("properties").is_some() { "object".into() } else { "unknown".into() }
        })
}

fn flatten_union(outer: Map<String, Value>, alternatives: Vec<Value>) -> Value {
    if alternatives.is_empty() {
        return sanitize_object(outer);
    }

    let labels: Vec<String> = alternatives.iter().map(type_label).collect();
    // Highest rank wins; ties go to the first alternative.
    let winner_idx = alternatives
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| rank(a).cmp(&rank(b)).then(ib.cmp(ia)))
        .map(|(i, _)| i)
        .unwrap_or(0);

    let mut winner = match alternatives.into_iter().nth(winner_idx) {
        Some(Value::Object(m)) => m,
        Some(other) => return sanitize_schema(other),
        None => Map::new(),
    };

    // Keys on the union node itself (description etc.) survive unless
    // the winner defines them.
    for (k, v) in outer {
        winner.entry(k).or_insert(v);
    }
    append_description(&mut winner, &format!("Accepts: {}", labels.join(" | ")));
    sanitize_object(winner)
}

fn append_description(map: &mut Map<String, Value>, note: &str) {
    let existing = map.get("description").and_then(Value::as_str).unwrap_or("");
    let combined = if existing.is_empty() {
        note.to_string()
    } else {
        format!("{existing} {note}")
    };
    map.insert("description".into(), Value::String(combined));
}

fn terse(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_name_strips_invalid_chars() {
        assert_eq!(sanitize_tool_name("my.tool:v2"), "my_tool_v2");
    }

    #[test]
    fn tool_name_truncates_to_64() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_tool_name(&long).len(), 64);
    }

    #[test]
    fn tool_name_empty_falls_back() {
        assert_eq!(sanitize_tool_name(""), "tool");
    }

    #[test]
    fn primitive_types_are_uppercased() {
        let s = sanitize_schema(json!({ "type": "string" }));
        assert_eq!(s["type"], "STRING");
    }

    #[test]
    fn type_array_takes_first_non_null() {
        let s = sanitize_schema(json!({ "type": ["null", "integer"] }));
        assert_eq!(s["type"], "INTEGER");
    }

    #[test]
    fn const_becomes_single_element_enum() {
        let s = sanitize_schema(json!({ "type": "string", "const": "fixed" }));
        assert_eq!(s["enum"], json!(["fixed"]));
        assert!(s.get("const").is_none());
    }

    #[test]
    fn ref_is_inlined_with_hint() {
        let s = sanitize_schema(json!({ "$ref": "#/definitions/Thing" }));
        assert_eq!(s["type"], "OBJECT");
        assert!(s["description"].as_str().unwrap().contains("#/definitions/Thing"));
    }

    #[test]
    fn all_of_merges_properties_and_required() {
        let s = sanitize_schema(json!({
            "allOf": [
                { "type": "object", "properties": { "a": { "type": "string" } }, "required": ["a"] },
                { "type": "object", "properties": { "b": { "type": "integer" } }, "required": ["b"] }
            ]
        }));
        assert_eq!(s["type"], "OBJECT");
        assert_eq!(s["properties"]["a"]["type"], "STRING");
        assert_eq!(s["properties"]["b"]["type"], "INTEGER");
        assert_eq!(s["required"], json!(["a", "b"]));
        assert!(s.get("allOf").is_none());
    }

    #[test]
    fn any_of_picks_object_over_primitive() {
        let s = sanitize_schema(json!({
            "type": "object",
            "properties": {
                "x": {
                    "anyOf": [
                        { "type": "string" },
                        { "type": "object", "properties": { "k": { "type": "integer" } } }
                    ]
                }
            }
        }));
        let x = &s["properties"]["x"];
        assert_eq!(x["type"], "OBJECT");
        assert_eq!(x["properties"]["k"]["type"], "INTEGER");
        assert!(x["description"].as_str().unwrap().contains("Accepts: string | object"));
        assert!(x.get("anyOf").is_none());
    }

    #[test]
    fn any_of_tie_goes_to_first() {
        let s = sanitize_schema(json!({
            "anyOf": [
                { "type": "string", "description": "first" },
                { "type": "integer", "description": "second" }
            ]
        }));
        assert_eq!(s["type"], "STRING");
        assert!(s["description"].as_str().unwrap().starts_with("first"));
    }

    #[test]
    fn one_of_array_beats_primitive() {
        let s = sanitize_schema(json!({
            "oneOf": [
                { "type": "boolean" },
                { "type": "array", "items": { "type": "string" } }
            ]
        }));
        assert_eq!(s["type"], "ARRAY");
        assert_eq!(s["items"]["type"], "STRING");
    }

    #[test]
    fn string_constraints_fold_into_description() {
        let s = sanitize_schema(json!({
            "type": "string",
            "minLength": 3,
            "pattern": "^a",
            "format": "email"
        }));
        assert!(s.get("minLength").is_none());
        assert!(s.get("pattern").is_none());
        assert!(s.get("format").is_none());
        let d = s["description"].as_str().unwrap();
        assert!(d.contains("minLength=3"));
        assert!(d.contains("pattern=^a"));
        assert!(d.contains("format=email"));
    }

    #[test]
    fn numeric_bounds_fold_into_description() {
        let s = sanitize_schema(json!({
            "type": "integer",
            "minimum": 0,
            "maximum": 10,
            "exclusiveMaximum": 11
        }));
        assert!(s.get("minimum").is_none());
        assert!(s.get("maximum").is_none());
        assert!(s.get("exclusiveMaximum").is_none());
        let d = s["description"].as_str().unwrap();
        assert!(d.contains("minimum=0"));
        assert!(d.contains("maximum=10"));
        assert!(d.contains("exclusiveMaximum=11"));
    }

    #[test]
    fn boolean_additional_properties_is_dropped() {
        let s = sanitize_schema(json!({ "type": "object", "additionalProperties": false }));
        assert!(s.get("additionalProperties").is_none());
    }

    #[test]
    fn sanitize_is_idempotent() {
        let input = json!({
            "type": "object",
            "properties": {
                "x": {
                    "anyOf": [
                        { "type": "string" },
                        { "type": "object", "properties": { "k": { "type": "integer", "minimum": 0, "minLength": 1 } } }
                    ]
                },
                "y": { "type": ["null", "number"], "const": 5 }
            }
        });
        let once = sanitize_schema(input);
        let twice = sanitize_schema(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn nested_items_are_sanitized() {
        let s = sanitize_schema(json!({
            "type": "array",
            "items": { "type": "object", "properties": { "n": { "type": "number" } } }
        }));
        assert_eq!(s["items"]["properties"]["n"]["type"], "NUMBER");
    }
}
