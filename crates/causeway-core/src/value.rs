//! Helpers over `serde_json::Value` documents.

use serde_json::Value;

/// Structural equality with numeric comparison for numbers.
///
/// `serde_json` distinguishes `1` from `1.0`; for replication purposes the two
/// describe the same value, so numbers are compared by magnitude.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if x == y {
                return true;
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| deep_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Short JSON type name for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// True when both values are containers of the same kind.
pub fn same_container_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_))
    )
}

/// Serialize with object keys sorted at every depth.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a string cannot fail.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Number(number) => write_number(number, out),
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Numbers are written from their `f64` magnitude, the same view
/// [`deep_equal`] compares, with integral values written without a fraction.
fn write_number(number: &serde_json::Number, out: &mut String) {
    let Some(x) = number.as_f64() else {
        out.push_str(&number.to_string());
        return;
    };
    if x.fract() == 0.0 && x.abs() < 1e21 {
        out.push_str(&(x as i128).to_string());
    } else {
        out.push_str(&Value::from(x).to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_equal_numbers() {
        assert!(deep_equal(&json!(1), &json!(1.0)));
        assert!(!deep_equal(&json!(1), &json!(2)));
        assert!(!deep_equal(&json!(1), &json!("1")));
    }

    #[test]
    fn test_deep_equal_nested() {
        let a = json!({"a": [1, {"b": 2.0}], "c": null});
        let b = json!({"c": null, "a": [1.0, {"b": 2}]});
        assert!(deep_equal(&a, &b));
        assert!(!deep_equal(&a, &json!({"a": [1, {"b": 2}]})));
    }

    #[test]
    fn test_canonical_string_sorts_keys() {
        let v = json!({"z": 1, "a": {"y": true, "b": [3, "x"]}});
        assert_eq!(
            to_canonical_string(&v),
            r#"{"a":{"b":[3,"x"],"y":true},"z":1}"#
        );
    }

    #[test]
    fn test_canonical_numbers_follow_equality() {
        for (a, b) in [
            (json!(1), json!(1.0)),
            (json!(-0.0), json!(0)),
            (json!({"n": [2, 1e3]}), json!({"n": [2.0, 1000]})),
        ] {
            assert!(deep_equal(&a, &b));
            assert_eq!(to_canonical_string(&a), to_canonical_string(&b));
        }
        assert_eq!(to_canonical_string(&json!(1.0)), "1");
        assert_eq!(to_canonical_string(&json!(2.5)), "2.5");
        assert_ne!(to_canonical_string(&json!(1)), to_canonical_string(&json!(1.5)));
    }

    #[test]
    fn test_type_name() {
        assert_eq!(type_name(&json!([])), "array");
        assert_eq!(type_name(&json!(null)), "null");
    }
}
