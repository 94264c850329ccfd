//! Canonical hashing for replay, idempotency, and content addressing.
//!
//! Every hash in Corvusforge is computed over **canonical JSON bytes**:
//! sorted keys, compact separators, ASCII-escaped strings, UTF-8 encoding.
//! Identical logical values produce identical bytes — and therefore
//! identical digests — on every platform.
//!
//! Floats are rejected outright. A float in a hashed payload is an
//! ambiguity waiting to break a chain; integers, strings, booleans, nulls,
//! arrays, and string-keyed objects are the full vocabulary.

use std::fmt::Write as _;

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors produced while canonicalizing a value for hashing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CanonicalError {
    /// The value contains a float, which has no canonical representation.
    #[error("floats are not permitted in hashed payloads: {value}")]
    FloatNotPermitted {
        /// Display form of the offending number.
        value: String,
    },

    /// The value could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Produces canonical JSON bytes for a value.
///
/// Properties:
/// - object keys sorted lexicographically
/// - `,` and `:` separators, no insignificant whitespace
/// - non-ASCII and control characters escaped as `\uXXXX`
/// - integers serialized as integers; floats rejected
///
/// Map keys are strings by construction of [`serde_json::Value`], so
/// non-string keys cannot reach this function.
///
/// # Errors
///
/// Returns [`CanonicalError::FloatNotPermitted`] if any number in the value
/// is a float.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out.into_bytes())
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), CanonicalError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let _ = write!(out, "{i}");
            } else if let Some(u) = n.as_u64() {
                let _ = write!(out, "{u}");
            } else {
                return Err(CanonicalError::FloatNotPermitted {
                    value: n.to_string(),
                });
            }
        },
        Value::String(s) => write_escaped(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        },
        Value::Object(map) => {
            // serde_json's default map is ordered, but sort explicitly so the
            // canonical form does not depend on feature flags.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push('}');
        },
    }
    Ok(())
}

/// Writes a JSON string literal with all non-ASCII escaped.
fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 || (c as u32) > 0x7e => {
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    let _ = write!(out, "\\u{unit:04x}");
                }
            },
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Returns the SHA-256 hex digest of raw bytes.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Content-addresses a JSON value.
///
/// Returns the `sha256:<hex>` form used by the artifact store.
///
/// # Errors
///
/// Returns an error if the value cannot be canonicalized.
pub fn content_address(value: &Value) -> Result<String, CanonicalError> {
    Ok(format!("sha256:{}", sha256_hex(&canonical_bytes(value)?)))
}

/// SHA-256 of canonical `{stage_id, inputs}`.
///
/// Replay detection: unchanged inputs mean a replayed stage should
/// reproduce the same output.
///
/// # Errors
///
/// Returns an error if the inputs cannot be canonicalized.
pub fn compute_input_hash(stage_id: &str, inputs: &Value) -> Result<String, CanonicalError> {
    let payload = serde_json::json!({ "stage_id": stage_id, "inputs": inputs });
    Ok(sha256_hex(&canonical_bytes(&payload)?))
}

/// SHA-256 of canonical `{stage_id, outputs}`.
///
/// # Errors
///
/// Returns an error if the outputs cannot be canonicalized.
pub fn compute_output_hash(stage_id: &str, outputs: &Value) -> Result<String, CanonicalError> {
    let payload = serde_json::json!({ "stage_id": stage_id, "outputs": outputs });
    Ok(sha256_hex(&canonical_bytes(&payload)?))
}

/// SHA-256 of a ledger entry's canonical JSON, excluding `entry_hash`.
///
/// This is the seal that makes each entry tamper-evident.
///
/// # Errors
///
/// Returns an error if the entry map cannot be canonicalized.
pub fn compute_entry_hash(entry: &Value) -> Result<String, CanonicalError> {
    let mut trimmed = entry.clone();
    if let Value::Object(map) = &mut trimmed {
        map.remove("entry_hash");
    }
    Ok(sha256_hex(&canonical_bytes(&trimmed)?))
}

#[cfg(test)]
mod unit_tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_sorted_keys_compact() {
        let v = json!({"b": 1, "a": [true, null, "x"]});
        let bytes = canonical_bytes(&v).unwrap();
        assert_eq!(bytes, br#"{"a":[true,null,"x"],"b":1}"#);
    }

    #[test]
    fn test_identical_values_identical_bytes() {
        let a = json!({"k": 1, "j": {"z": "v", "a": "w"}});
        let b: Value = serde_json::from_str(r#"{"j":{"a":"w","z":"v"},"k":1}"#).unwrap();
        assert_eq!(canonical_bytes(&a).unwrap(), canonical_bytes(&b).unwrap());
    }

    #[test]
    fn test_parse_reserialize_roundtrip() {
        let original = json!({"arr": [1, 2, {"n": null}], "s": "text", "t": true});
        let bytes = canonical_bytes(&original).unwrap();
        let reparsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(canonical_bytes(&reparsed).unwrap(), bytes);
    }

    #[test]
    fn test_non_ascii_escaped() {
        let v = json!({"name": "ångström"});
        let s = String::from_utf8(canonical_bytes(&v).unwrap()).unwrap();
        assert_eq!(s, r#"{"name":"\u00e5ngstr\u00f6m"}"#);
    }

    #[test]
    fn test_astral_plane_surrogate_pair() {
        let v = json!("🦀");
        let s = String::from_utf8(canonical_bytes(&v).unwrap()).unwrap();
        assert_eq!(s, r#""\ud83e\udd80""#);
    }

    #[test]
    fn test_control_chars_escaped() {
        let v = json!("a\nb\u{1}c");
        let s = String::from_utf8(canonical_bytes(&v).unwrap()).unwrap();
        assert_eq!(s, r#""a\nb\u0001c""#);
    }

    #[test]
    fn test_floats_rejected() {
        let v = json!({"x": 1.5});
        assert!(matches!(
            canonical_bytes(&v),
            Err(CanonicalError::FloatNotPermitted { .. })
        ));
    }

    #[test]
    fn test_large_u64_preserved() {
        let v = json!(u64::MAX);
        let bytes = canonical_bytes(&v).unwrap();
        assert_eq!(bytes, u64::MAX.to_string().as_bytes());
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_content_address_prefix() {
        let addr = content_address(&json!({"k": "v"})).unwrap();
        assert!(addr.starts_with("sha256:"));
        assert_eq!(addr.len(), "sha256:".len() + 64);
    }

    #[test]
    fn test_input_output_hashes_differ() {
        let payload = json!({"k": "v"});
        let input = compute_input_hash("s1", &payload).unwrap();
        let output = compute_output_hash("s1", &payload).unwrap();
        assert_ne!(input, output);
    }

    #[test]
    fn test_entry_hash_excludes_entry_hash_field() {
        let with = json!({"a": 1, "entry_hash": "deadbeef"});
        let without = json!({"a": 1, "entry_hash": ""});
        assert_eq!(
            compute_entry_hash(&with).unwrap(),
            compute_entry_hash(&without).unwrap()
        );
    }
}
