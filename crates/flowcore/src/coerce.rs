//! Guarded conversion between strings and structured values.
//!
//! Nothing here runs speculatively: every entry point takes the target
//! [`ValueKind`] from the caller, and only container targets ever trigger
//! a parse. Scalars such as `"007"` or `"1e3"` are never turned into
//! numbers.

use crate::{Value, ValueKind};

/// Largest string (in bytes) that will be considered for parsing.
pub const DEFAULT_COERCION_LIMIT: usize = 1024 * 1024;

/// Parse `text` as a JSON container of kind `target`.
///
/// Returns `None` when the target is not a container, the text exceeds
/// `limit`, its first non-whitespace character does not open the target
/// container, or it does not parse to exactly that kind.
pub fn parse_container(text: &str, target: ValueKind, limit: usize) -> Option<Value> {
    let opener = match target {
        ValueKind::Object => '{',
        ValueKind::Array => '[',
        _ => return None,
    };
    if text.len() > limit {
        return None;
    }
    if !text.trim_start().starts_with(opener) {
        return None;
    }

    let parsed: Value = serde_json::from_str(text).ok()?;
    (ValueKind::of(&parsed) == target).then_some(parsed)
}

/// Adapt `value` to the kind declared by the slot it is bound into.
///
/// A string bound into an object/array slot is parsed when it holds a
/// matching container; a container bound into a string slot is serialized.
/// Every other combination returns the value unchanged.
pub fn coerce(value: Value, expected: ValueKind) -> Value {
    coerce_with_limit(value, expected, DEFAULT_COERCION_LIMIT)
}

pub fn coerce_with_limit(value: Value, expected: ValueKind, limit: usize) -> Value {
    match (value, expected) {
        (Value::String(text), ValueKind::Object | ValueKind::Array) => {
            match parse_container(&text, expected, limit) {
                Some(parsed) => parsed,
                None => Value::String(text),
            }
        }
        (value @ (Value::Object(_) | Value::Array(_)), ValueKind::String) => {
            Value::String(value.to_string())
        }
        (value, _) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_object_string_into_object_slot() {
        let value = coerce(json!(r#" {"a": 1}"#), ValueKind::Object);
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn parses_array_string_into_array_slot() {
        let value = coerce(json!("[1, 2, 3]"), ValueKind::Array);
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn never_parses_numeric_looking_strings() {
        assert_eq!(coerce(json!("007"), ValueKind::Number), json!("007"));
        assert_eq!(coerce(json!("007"), ValueKind::Any), json!("007"));
        assert_eq!(parse_container("42", ValueKind::Number, usize::MAX), None);
    }

    #[test]
    fn rejects_mismatched_container() {
        assert_eq!(coerce(json!("[1]"), ValueKind::Object), json!("[1]"));
        assert_eq!(coerce(json!("{not json"), ValueKind::Object), json!("{not json"));
    }

    #[test]
    fn respects_size_limit() {
        let text = "[1, 2, 3]";
        assert_eq!(parse_container(text, ValueKind::Array, 4), None);
        assert!(parse_container(text, ValueKind::Array, text.len()).is_some());
    }

    #[test]
    fn serializes_container_into_string_slot() {
        let value = coerce(json!({"k": [true]}), ValueKind::String);
        assert_eq!(value, json!(r#"{"k":[true]}"#));
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let original = json!({"items": [{"id": "001"}, {"id": 2}], "ok": false});
        let text = coerce(original.clone(), ValueKind::String);
        let back = coerce(text, ValueKind::Object);
        assert_eq!(back, original);
    }
}
