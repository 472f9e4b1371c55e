//! Canonical JSON rendering.
//!
//! Object keys are sorted recursively; array order is preserved. Used by the
//! `diff` gate and by block-contract hashing so structurally equal values
//! always render to the same string.

use serde_json::Value;

/// Render a value in canonical form: sorted object keys, compact separators.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
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
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_keys_sorted() {
        let a = json!({"b": 1, "a": {"z": true, "y": null}});
        let b = json!({"a": {"y": null, "z": true}, "b": 1});
        assert_eq!(canonical_string(&a), canonical_string(&b));
        assert_eq!(canonical_string(&a), r#"{"a":{"y":null,"z":true},"b":1}"#);
    }

    #[test]
    fn test_array_order_preserved() {
        let a = json!([2, 1]);
        let b = json!([1, 2]);
        assert_ne!(canonical_string(&a), canonical_string(&b));
    }
}
