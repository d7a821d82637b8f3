//! Canonical JSON serialization and content addressing.
//!
//! Receipts, contexts, decisions, and idempotency keys are all identified by
//! the SHA-256 digest of a canonical byte encoding, so this module is part of
//! the public contract: two runtimes that disagree on a single byte produce
//! different receipt ids and signatures that do not verify.
//!
//! # Canonical form
//!
//! The encoding follows RFC 8785 (JCS) with one extra constraint:
//!
//! 1. Object keys are emitted in lexicographic (codepoint) order
//! 2. No whitespace between tokens
//! 3. Strings use minimal escaping (only `"`, `\`, and control characters
//!    U+0000 through U+001F)
//! 4. Numbers must be integers within the signed 64-bit range; any other
//!    number is rejected with [`CanonicalError::FloatNotAllowed`] because
//!    float formatting is not deterministic across runtimes
//!
//! Null values inside maps are preserved: an explicitly-null field is part of
//! the canonical form. Callers that want a field omitted must not insert it.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//!
//! let bytes = relia_core::canonical::canonicalize(&json!({"z": 1, "a": 2})).unwrap();
//! assert_eq!(bytes, br#"{"a":2,"z":1}"#);
//! ```

use std::fmt::Write as _;

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum nesting depth accepted by the canonicalizer.
///
/// Structures nested deeper than this are rejected to prevent stack
/// exhaustion on adversarial input.
pub const MAX_DEPTH: usize = 128;

/// Errors that can occur during canonicalization.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// A non-integer number was encountered.
    #[error("float not allowed: canonical JSON requires integer-only numbers")]
    FloatNotAllowed,

    /// A number is outside the signed 64-bit integer range.
    #[error("number out of range: {value} is outside signed 64-bit integer range")]
    NumberOutOfRange {
        /// String representation of the out-of-range number.
        value: String,
    },

    /// The maximum nesting depth was exceeded.
    #[error("max depth exceeded: value nested deeper than {max_depth} levels")]
    MaxDepthExceeded {
        /// The depth limit that was exceeded.
        max_depth: usize,
    },
}

/// Produces the canonical byte encoding of a JSON value tree.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the tree contains a non-integer number, a
/// number outside i64 range, or nesting deeper than [`MAX_DEPTH`] levels.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    validate_value(value, 0)?;
    let mut output = String::new();
    emit_value(value, &mut output);
    Ok(output.into_bytes())
}

/// Returns the raw SHA-256 digest of a canonical byte sequence.
#[must_use]
pub fn digest_bytes(canonical: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(canonical);
    hasher.finalize().into()
}

/// Returns the prefixed digest form `sha256:<hex>` of a canonical byte
/// sequence.
///
/// This is the content-address format used everywhere an identifier is
/// derived from content: receipt ids, context ids, decision ids, and policy
/// hashes.
#[must_use]
pub fn digest_prefix(canonical: &[u8]) -> String {
    format!("sha256:{}", hex::encode(digest_bytes(canonical)))
}

/// Canonicalizes a value and returns its prefixed digest.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value cannot be canonicalized.
pub fn digest_value(value: &Value) -> Result<String, CanonicalError> {
    Ok(digest_prefix(&canonicalize(value)?))
}

/// Recursively validates a value against the canonical constraints.
fn validate_value(value: &Value, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }

    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
        Value::Number(n) => validate_number(n),
        Value::Array(arr) => {
            for item in arr {
                validate_value(item, depth + 1)?;
            }
            Ok(())
        },
        Value::Object(obj) => {
            for val in obj.values() {
                validate_value(val, depth + 1)?;
            }
            Ok(())
        },
    }
}

/// Validates that a number is an integer within i64 range.
fn validate_number(n: &Number) -> Result<(), CanonicalError> {
    if n.is_i64() {
        return Ok(());
    }

    if let Some(u) = n.as_u64() {
        if u > i64::MAX as u64 {
            return Err(CanonicalError::NumberOutOfRange {
                value: u.to_string(),
            });
        }
        return Ok(());
    }

    Err(CanonicalError::FloatNotAllowed)
}

/// Emits a JSON value in canonical form.
fn emit_value(value: &Value, output: &mut String) {
    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(b) => output.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, output),
        Value::String(s) => emit_string(s, output),
        Value::Array(arr) => emit_array(arr, output),
        Value::Object(obj) => emit_object(obj, output),
    }
}

/// Emits an integer in decimal form.
///
/// Validation has already rejected everything else.
fn emit_number(n: &Number, output: &mut String) {
    if let Some(i) = n.as_i64() {
        let _ = write!(output, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(output, "{u}");
    }
}

/// Emits a string with minimal escaping per RFC 8785 Section 3.2.2.2.
fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            },
            c => output.push(c),
        }
    }
    output.push('"');
}

/// Emits an array, preserving element order.
fn emit_array(arr: &[Value], output: &mut String) {
    output.push('[');
    for (i, item) in arr.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_value(item, output);
    }
    output.push(']');
}

/// Emits an object with keys in lexicographic order.
fn emit_object(obj: &Map<String, Value>, output: &mut String) {
    let mut sorted_keys: Vec<&String> = obj.keys().collect();
    sorted_keys.sort();

    output.push('{');
    for (i, key) in sorted_keys.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(&obj[*key], output);
    }
    output.push('}');
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sorts_object_keys() {
        let bytes = canonicalize(&json!({"z": 1, "a": 2, "m": 3})).unwrap();
        assert_eq!(bytes, br#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn sorts_nested_object_keys() {
        let bytes = canonicalize(&json!({"outer": {"z": 1, "a": 2}})).unwrap();
        assert_eq!(bytes, br#"{"outer":{"a":2,"z":1}}"#);
    }

    #[test]
    fn preserves_array_order() {
        let bytes = canonicalize(&json!([3, 1, 2])).unwrap();
        assert_eq!(bytes, b"[3,1,2]");
    }

    #[test]
    fn preserves_null_map_values() {
        let bytes = canonicalize(&json!({"a": null, "b": 1})).unwrap();
        assert_eq!(bytes, br#"{"a":null,"b":1}"#);
    }

    #[test]
    fn emits_primitives() {
        assert_eq!(canonicalize(&json!(null)).unwrap(), b"null");
        assert_eq!(canonicalize(&json!(true)).unwrap(), b"true");
        assert_eq!(canonicalize(&json!(false)).unwrap(), b"false");
        assert_eq!(canonicalize(&json!(42)).unwrap(), b"42");
        assert_eq!(canonicalize(&json!(-42)).unwrap(), b"-42");
        assert_eq!(canonicalize(&json!("hello")).unwrap(), br#""hello""#);
    }

    #[test]
    fn rejects_float() {
        let result = canonicalize(&json!({"x": 0.5}));
        assert!(matches!(result, Err(CanonicalError::FloatNotAllowed)));
    }

    #[test]
    fn rejects_float_in_array() {
        let result = canonicalize(&json!([1, 2.5, 3]));
        assert!(matches!(result, Err(CanonicalError::FloatNotAllowed)));
    }

    #[test]
    fn accepts_i64_extremes() {
        assert!(canonicalize(&json!({"x": i64::MAX})).is_ok());
        assert!(canonicalize(&json!({"x": i64::MIN})).is_ok());
    }

    #[test]
    fn rejects_u64_above_i64_max() {
        let result = canonicalize(&json!({"x": (i64::MAX as u64) + 1}));
        assert!(matches!(
            result,
            Err(CanonicalError::NumberOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_excessive_depth() {
        let mut value = json!(0);
        for _ in 0..(MAX_DEPTH + 2) {
            value = json!({ "nested": value });
        }
        let result = canonicalize(&value);
        assert!(matches!(
            result,
            Err(CanonicalError::MaxDepthExceeded { max_depth: MAX_DEPTH })
        ));
    }

    #[test]
    fn escapes_special_characters() {
        let bytes = canonicalize(&json!({"text": "line1\nline2\ttab"})).unwrap();
        assert_eq!(bytes, br#"{"text":"line1\nline2\ttab"}"#);

        let bytes = canonicalize(&json!({"text": "say \"hi\" and \\"})).unwrap();
        assert_eq!(bytes, br#"{"text":"say \"hi\" and \\"}"#);
    }

    #[test]
    fn escapes_control_characters_with_uxxxx() {
        let bytes = canonicalize(&json!({"text": "\u{0000}"})).unwrap();
        assert_eq!(bytes.as_slice(), "{\"text\":\"\\u0000\"}".as_bytes());
    }

    #[test]
    fn does_not_escape_del_or_c1_controls() {
        let canonical = String::from_utf8(canonicalize(&json!({"t": "\u{007F}"})).unwrap()).unwrap();
        assert!(!canonical.contains("\\u007f"));
        assert!(canonical.contains('\u{007F}'));
    }

    #[test]
    fn digest_is_stable_across_key_order() {
        let a = digest_value(&json!({"c": 3, "a": 1, "b": 2})).unwrap();
        let b = digest_value(&json!({"b": 2, "c": 3, "a": 1})).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 64);
    }

    #[test]
    fn digest_prefix_matches_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            digest_prefix(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
