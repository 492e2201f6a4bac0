//! Deterministic request fingerprints.
//!
//! A fingerprint is the SHA-256 of a length-delimited encoding of named
//! fields. Each field is written as
//!
//! ```text
//! u32 BE name length | name | u64 BE value length | value
//! ```
//!
//! so field boundaries are explicit and no two distinct field lists share an
//! encoding. JSON values go through [`canonical_json`] first, which makes
//! object key order and whitespace irrelevant.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex-encoded SHA-256 digest (64 lowercase characters).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Hash an ordered list of `(name, value)` fields.
pub fn fingerprint<N, V>(fields: &[(N, V)]) -> Fingerprint
where
    N: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for (name, value) in fields {
        let name = name.as_ref();
        let value = value.as_ref();
        hasher.update((name.len() as u32).to_be_bytes());
        hasher.update(name);
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Serialize JSON with object keys sorted and no insignificant whitespace.
///
/// Does not rely on `serde_json::Map` ordering, which changes with the
/// `preserve_order` feature.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(value, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    // Scalars serialize infallibly.
    if let Ok(bytes) = serde_json::to_vec(value) {
        out.extend_from_slice(&bytes);
    }
}
