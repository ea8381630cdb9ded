//! JSON helpers
//!
//! The service mixes numbers and strings for the same field (uins arrive
//! as numbers in some responses and strings in others), so lookups here
//! return scalars in their textual form.

use serde_json::Value;

use crate::error::ProtocolError;

/// Parse a response body
pub fn parse(text: &str) -> Result<Value, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Depth-first search for the first field named `key`
pub fn find_field<'a>(tree: &'a Value, key: &str) -> Option<&'a Value> {
    match tree {
        Value::Object(map) => {
            if let Some(value) = map.get(key) {
                return Some(value);
            }
            map.values().find_map(|v| find_field(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_field(v, key)),
        _ => None,
    }
}

/// Textual form of a scalar; None for null, arrays and objects
pub fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

/// Scalar field of an object (direct child only)
pub fn field(obj: &Value, key: &str) -> Option<String> {
    obj.get(key).and_then(scalar)
}

/// Scalar field that must be present
pub fn required(obj: &Value, key: &'static str) -> Result<String, ProtocolError> {
    field(obj, key).ok_or(ProtocolError::MissingField(key))
}

/// Integer field, accepting numbers or numeric strings
pub fn int_field(obj: &Value, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

/// Id as a JSON value: a number when it is plain decimal, else a string
pub fn id_value(id: &str) -> Value {
    match id.parse::<u64>() {
        Ok(n) if n.to_string() == id => Value::from(n),
        _ => Value::from(id),
    }
}

/// Top-level `retcode`; missing means 0
pub fn retcode(tree: &Value) -> i64 {
    int_field(tree, "retcode").unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_forms() {
        let v = json!({"uin": 570454553, "status": "online", "vip": true, "x": null});
        assert_eq!(field(&v, "uin").as_deref(), Some("570454553"));
        assert_eq!(field(&v, "status").as_deref(), Some("online"));
        assert_eq!(field(&v, "vip").as_deref(), Some("1"));
        assert_eq!(field(&v, "x"), None);
        assert_eq!(field(&v, "missing"), None);
    }

    #[test]
    fn test_find_field_nested() {
        let v = json!({"retcode": 0, "result": {"info": [{"uin": 1, "nick": "a"}]}});
        assert_eq!(find_field(&v, "nick"), Some(&json!("a")));
        assert!(find_field(&v, "absent").is_none());
    }

    #[test]
    fn test_int_field_accepts_strings() {
        let v = json!({"size": "12", "n": 7, "bad": "x"});
        assert_eq!(int_field(&v, "size"), Some(12));
        assert_eq!(int_field(&v, "n"), Some(7));
        assert_eq!(int_field(&v, "bad"), None);
    }

    #[test]
    fn test_id_value() {
        assert_eq!(id_value("9001"), json!(9001));
        assert_eq!(id_value("0042"), json!("0042"));
        assert_eq!(id_value("abc"), json!("abc"));
        assert_eq!(id_value(""), json!(""));
    }

    #[test]
    fn test_retcode_default() {
        assert_eq!(retcode(&json!({"result": []})), 0);
        assert_eq!(retcode(&json!({"retcode": 121})), 121);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(parse("{not json"), Err(ProtocolError::Json(_))));
    }
}
