// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use unicode_normalization::{UnicodeNormalization, is_nfc};

/// A JSON object payload as stored on ledger events.
pub type JsonMap = Map<String, Value>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Violations of the canonical encoding policy.
///
/// Each variant carries the key path of the offending value
/// (e.g. `payload.rolls[2]`) so programmer errors surface with context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonicalError {
    /// A float was encountered; only integers are permitted.
    #[error("float values not permitted in canonical JSON at {path}; pre-multiply or use a string")]
    FloatNotPermitted {
        /// Key path of the offending value.
        path: String,
    },

    /// An integer outside the signed 64-bit range was encountered.
    #[error("integer at {path} outside signed 64-bit range")]
    IntegerOutOfRange {
        /// Key path of the offending value.
        path: String,
    },
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a payload as canonical JSON bytes.
///
/// Rules applied:
/// - keys and string values are NFC-normalized, then keys are sorted by
///   code point (UTF-8 byte order);
/// - null-valued object fields are elided at every depth; null array
///   elements are retained;
/// - numbers must be integers within `[-2^63, 2^63 - 1]`;
/// - compact `,` / `:` separators, no whitespace;
/// - non-ASCII characters are emitted verbatim as UTF-8.
///
/// The [`Value`] input model makes non-JSON types (dates, sets, custom
/// objects) unrepresentable; the float and range policies are enforced
/// here.
///
/// # Errors
///
/// [`CanonicalError`] when the payload contains a float or an integer
/// outside the signed 64-bit range.
///
/// # Examples
///
/// ```
/// use saga_canonical::canonical_bytes;
/// use serde_json::json;
///
/// let a = json!({"b": 1, "a": null, "s": "caf\u{e9}"});
/// let b = json!({"s": "cafe\u{301}", "b": 1});
/// let (a, b) = (a.as_object().unwrap(), b.as_object().unwrap());
/// assert_eq!(canonical_bytes(a).unwrap(), canonical_bytes(b).unwrap());
/// ```
pub fn canonical_bytes(payload: &JsonMap) -> Result<Vec<u8>, CanonicalError> {
    let mut out = Vec::with_capacity(128);
    write_object(payload, &mut out, &mut PathTracker::root())?;
    Ok(out)
}

/// SHA-256 digest over [`canonical_bytes`].
///
/// # Errors
///
/// Propagates [`CanonicalError`] from encoding.
pub fn canonical_hash(payload: &JsonMap) -> Result<[u8; 32], CanonicalError> {
    let bytes = canonical_bytes(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}

/// Hex-encoded [`canonical_hash`], for goldens and diagnostics.
///
/// # Errors
///
/// Propagates [`CanonicalError`] from encoding.
pub fn canonical_hash_hex(payload: &JsonMap) -> Result<String, CanonicalError> {
    let digest = canonical_hash(payload)?;
    let mut s = String::with_capacity(64);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    Ok(s)
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// Tracks the key path for error messages. Segments are only joined when
/// an error is actually produced.
struct PathTracker {
    segments: Vec<String>,
}

impl PathTracker {
    fn root() -> Self {
        Self {
            segments: vec!["payload".to_string()],
        }
    }

    fn push_key(&mut self, key: &str) {
        self.segments.push(format!(".{key}"));
    }

    fn push_index(&mut self, idx: usize) {
        self.segments.push(format!("[{idx}]"));
    }

    fn pop(&mut self) {
        self.segments.pop();
    }

    fn render(&self) -> String {
        self.segments.concat()
    }
}

fn nfc(value: &str) -> String {
    if is_nfc(value) {
        value.to_string()
    } else {
        value.nfc().collect()
    }
}

fn write_object(
    map: &JsonMap,
    out: &mut Vec<u8>,
    path: &mut PathTracker,
) -> Result<(), CanonicalError> {
    // Normalize keys first so the sort order reflects the encoded form.
    let mut entries: Vec<(String, &Value)> = map
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (nfc(k), v))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    out.push(b'{');
    for (i, (key, value)) in entries.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        write_string(key, out);
        out.push(b':');
        path.push_key(key);
        write_value(value, out, path)?;
        path.pop();
    }
    out.push(b'}');
    Ok(())
}

fn write_value(
    value: &Value,
    out: &mut Vec<u8>,
    path: &mut PathTracker,
) -> Result<(), CanonicalError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.extend_from_slice(i.to_string().as_bytes());
            } else if n.as_u64().is_some() {
                return Err(CanonicalError::IntegerOutOfRange {
                    path: path.render(),
                });
            } else {
                // serde_json cannot represent NaN/infinity; any remaining
                // number is a finite float and the policy rejects it.
                return Err(CanonicalError::FloatNotPermitted {
                    path: path.render(),
                });
            }
        }
        Value::String(s) => write_string(&nfc(s), out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                path.push_index(i);
                write_value(item, out, path)?;
                path.pop();
            }
            out.push(b']');
        }
        Value::Object(map) => write_object(map, out, path)?,
    }
    Ok(())
}

/// Minimal JSON string escaping: `"` and `\` escaped, control characters
/// as `\b`, `\t`, `\n`, `\f`, `\r`, or `\u00XX`; everything else verbatim.
fn write_string(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for ch in s.chars() {
        match ch {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\u{08}' => out.extend_from_slice(b"\\b"),
            '\t' => out.extend_from_slice(b"\\t"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\u{0c}' => out.extend_from_slice(b"\\f"),
            '\r' => out.extend_from_slice(b"\\r"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
