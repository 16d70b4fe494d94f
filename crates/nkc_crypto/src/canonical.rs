//! Deterministic byte encoding of structured values.
//!
//! The output is compact JSON with object keys sorted lexicographically (by
//! UTF-8 bytes) at every depth and arrays kept in their original order. Two
//! values that compare equal as JSON always encode to identical bytes, which
//! makes the encoding safe to sign and hash.
//!
//! Signers and verifiers MUST both go through [`to_canonical_bytes`]; never
//! sign `serde_json::to_vec` output directly, its key order depends on the
//! struct declaration and on crate features.

use serde::Serialize;
use serde_json::Value;

use crate::error::CryptoError;

/// Serialize `value` and return its canonical byte encoding.
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CryptoError> {
    let value = serde_json::to_value(value)?;
    Ok(canonicalize(&value))
}

/// Canonical encoding of an already-built JSON value.
pub fn canonicalize(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push(b'{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(k, out);
                out.push(b':');
                write_value(v, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(v, out);
            }
            out.push(b']');
        }
        Value::String(s) => write_string(s, out),
        // Null, bool and numbers have a single compact form in serde_json.
        other => out.extend_from_slice(other.to_string().as_bytes()),
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    // serde_json string escaping is deterministic; reuse it.
    out.extend_from_slice(Value::String(s.to_owned()).to_string().as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_at_every_depth() {
        let v = json!({"b": 1, "a": {"z": true, "m": null}, "c": [3, 1, 2]});
        let bytes = canonicalize(&v);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"m":null,"z":true},"b":1,"c":[3,1,2]}"#
        );
    }

    #[test]
    fn equal_values_encode_identically() {
        let a = json!({"x": "1", "y": [{"q": 1, "p": 2}]});
        let b: Value = serde_json::from_str(r#"{"y":[{"p":2,"q":1}],"x":"1"}"#).unwrap();
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn strings_are_escaped() {
        let v = json!({"k": "line\n\"quoted\""});
        assert_eq!(
            String::from_utf8(canonicalize(&v)).unwrap(),
            r#"{"k":"line\n\"quoted\""}"#
        );
    }
}
