//! Canonical JSON length helpers
//!
//! Protocol JSON is accepted only if its compacted length equals the length
//! re-derived from the decoded values. Duplicate keys, unknown fields and
//! trailing data all change the compacted length and are rejected this way.

use serde::{Deserialize, Deserializer};
use serde_json::value::RawValue;

/// Remove insignificant whitespace outside of JSON strings
pub fn compact(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut in_string = false;
    let mut escaped = false;

    for &b in data {
        if in_string {
            out.push(b);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b' ' | b'\t' | b'\n' | b'\r' => {}
            b'"' => {
                in_string = true;
                out.push(b);
            }
            _ => out.push(b),
        }
    }

    out
}

/// Decimal length of an unsigned integer
pub fn uint64_len(d: u64) -> usize {
    let mut len = 1;
    let mut d = d / 10;
    while d > 0 {
        len += 1;
        d /= 10;
    }
    len
}

/// Decimal length of a signed integer, including the sign
pub fn int64_len(d: i64) -> usize {
    let sign = usize::from(d < 0);
    sign + uint64_len(d.unsigned_abs())
}

/// Length of `,"name":""` plus the value, or zero for an absent string
pub fn str_field_len(name: &str, value: Option<&str>) -> usize {
    match value {
        Some(v) if !v.is_empty() => r#","":"""#.len() + name.len() + v.len(),
        _ => 0,
    }
}

/// Length of `,"metadata":` plus the raw value, or zero when absent
pub fn metadata_len(metadata: Option<&str>) -> usize {
    match metadata {
        Some(raw) => r#","metadata":"#.len() + raw.len(),
        None => 0,
    }
}

/// Deserialize any present JSON value, including `null`, as its raw text.
///
/// Use with `#[serde(default)]` so that only a missing field becomes `None`.
pub fn raw_some<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Box::<RawValue>::deserialize(deserializer)?;
    Ok(Some(raw.get().to_string()))
}
