//! Deterministic cache-key fingerprinting.
//!
//! A fingerprint is the SHA-256 of the canonical JSON of an arbitrary
//! key object: object keys sorted, no whitespace. Two semantically
//! identical objects always produce the same key regardless of property
//! order.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render `value` as canonical JSON: sorted object keys, no whitespace.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Key serialization via serde_json handles escaping.
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

/// SHA-256 hex of the canonical JSON of `value`.
pub fn fingerprint(value: &Value) -> String {
    hash_str(&canonicalize(value))
}

/// SHA-256 hex of a literal key string. Used for on-disk file names.
pub fn hash_str(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_sorts_keys() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        assert_eq!(canonicalize(&a), r#"{"a":{"y":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn test_fingerprint_order_independent() {
        let a = json!({"model": "m", "prompt": "p", "temperature": 0.5});
        let b = json!({"temperature": 0.5, "prompt": "p", "model": "m"});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_value_sensitive() {
        let a = json!({"prompt": "p1"});
        let b = json!({"prompt": "p2"});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_idempotent() {
        let v = json!({"nested": {"list": [1, null, "x"]}});
        assert_eq!(fingerprint(&v), fingerprint(&v));
    }

    #[test]
    fn test_hash_str_is_sha256_hex() {
        let h = hash_str("k");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_canonical_escapes_keys() {
        let v = json!({"we\"ird": 1});
        let canon = canonicalize(&v);
        assert_eq!(canon, r#"{"we\"ird":1}"#);
        assert!(serde_json::from_str::<serde_json::Value>(&canon).is_ok());
    }
}
