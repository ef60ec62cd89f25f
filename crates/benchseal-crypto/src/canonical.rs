//! Canonical JSON serialization.
//!
//! Every hash and signature in BenchSeal covers the canonical form of a JSON
//! value, so independently written clients and servers must agree on it
//! byte for byte:
//!
//! - UTF-8 output, non-ASCII characters emitted raw (not `\u` escaped)
//! - object keys sorted by the byte order of their UTF-8 encoding, recursively
//! - no whitespace between tokens
//! - strings escaped as `serde_json` escapes them (`"`, `\\`, control characters)
//! - numbers in `serde_json`'s shortest round-trip form

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Serialize `value` into its canonical string form.
pub fn to_canonical_string(value: &Value) -> Result<String, CryptoError> {
    let mut out = String::new();
    write_value(&mut out, value)?;
    Ok(out)
}

/// Serialize any `Serialize` type into canonical JSON bytes.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CryptoError> {
    let value = serde_json::to_value(value)?;
    Ok(to_canonical_string(&value)?.into_bytes())
}

/// SHA-256 over the canonical form of `value`.
pub fn canonical_hash(value: &Value) -> Result<[u8; 32], CryptoError> {
    let canonical = to_canonical_string(value)?;
    Ok(Sha256::digest(canonical.as_bytes()).into())
}

fn write_value(out: &mut String, value: &Value) -> Result<(), CryptoError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // `Map` iteration order depends on serde_json features, so sort here.
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(out, item)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "m": null}});
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            r#"{"a":{"m":null,"z":true},"b":1}"#
        );
    }

    #[test]
    fn array_order_is_preserved() {
        let value = json!([3, 1, {"y": 2, "x": 1}]);
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            r#"[3,1,{"x":1,"y":2}]"#
        );
    }

    #[test]
    fn non_ascii_is_emitted_raw() {
        let value = json!({"name": "測試", "quote": "a\"b"});
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            r#"{"name":"測試","quote":"a\"b"}"#
        );
    }

    #[test]
    fn keys_sort_by_utf8_bytes_not_case_folded() {
        let value = json!({"a": 1, "B": 2, "é": 3});
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            r#"{"B":2,"a":1,"é":3}"#
        );
    }

    #[test]
    fn numbers_use_shortest_form() {
        let value = json!({"f": 1.5, "i": -7, "u": 18_446_744_073_709_551_615_u64});
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            r#"{"f":1.5,"i":-7,"u":18446744073709551615}"#
        );
    }

    #[test]
    fn hash_ignores_input_key_order() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":[1,2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{ "y" : [1, 2], "x" : 1 }"#).unwrap();
        assert_eq!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
    }

    #[test]
    fn canonical_bytes_of_struct() {
        #[derive(Serialize)]
        struct Sample {
            zeta: u8,
            alpha: &'static str,
        }
        let bytes = canonical_bytes(&Sample {
            zeta: 9,
            alpha: "x",
        })
        .unwrap();
        assert_eq!(bytes, br#"{"alpha":"x","zeta":9}"#);
    }
}
