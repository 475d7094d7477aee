// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Canonical payload digests.
//!
//! Payloads are JSON values whose object keys can arrive in any order, so the
//! digest is taken over a canonical rendering: object keys sorted, no
//! whitespace, strings and numbers in serde_json's encoding. The digest is
//! SHA-256, hex encoded.
//!
//! ```
//! use sync_reconciler::checksum;
//! use serde_json::json;
//!
//! let a = checksum::compute(&json!({"name": "Ada", "rank": 3}));
//! let b = checksum::compute(&json!({"rank": 3, "name": "Ada"}));
//! assert_eq!(a, b);
//! assert_eq!(a.len(), 64);
//! ```

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::SyncError;

/// Hex SHA-256 over the canonical form of `value`.
#[must_use]
pub fn compute(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Recompute and compare against `expected`.
pub fn verify(value: &Value, expected: &str) -> Result<(), SyncError> {
    let actual = compute(value);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        crate::metrics::record_checksum_mismatch();
        Err(SyncError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Deterministic, key-sorted JSON rendering.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
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
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key], out);
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
        Value::String(s) => write_string(s, out),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json string escaping cannot fail for &str
    out.push_str(&Value::String(s.to_string()).to_string());
}
