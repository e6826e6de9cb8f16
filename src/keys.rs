//! Key model for records and secondary indexes.
//!
//! Keys are JSON scalars (booleans, numbers, strings) or arrays of them.
//! They are encoded into byte strings whose lexicographic order matches the
//! key order within a type, so sled range scans walk keys in order.
//!
//! Numbers are keyed by their `f64` value. Integers beyond
//! [`MAX_SAFE_INTEGER`] in magnitude would lose precision and collide with
//! their neighbours, so they are rejected as `InvalidKey`.

use serde_json::Value;
use std::ops::Bound;

use crate::error::{Result, StoreError};
use crate::schema::{IndexSpec, KeyPath};

const TAG_BOOL: u8 = 0x08;
const TAG_NUMBER: u8 = 0x10;
const TAG_STRING: u8 = 0x20;
const TAG_ARRAY: u8 = 0x30;
const END: u8 = 0x00;
const ESCAPE: u8 = 0xFF;

/// Largest integer magnitude a key can hold exactly, `2^53 - 1`.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Encodes a key value into its order-preserving byte form.
pub fn encode_key(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_into(value, &mut out, false)?;
    Ok(out)
}

fn encode_into(value: &Value, out: &mut Vec<u8>, nested: bool) -> Result<()> {
    match value {
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        },
        Value::Number(n) => {
            let exact = match (n.as_u64(), n.as_i64()) {
                (Some(u), _) => u <= MAX_SAFE_INTEGER,
                (None, Some(i)) => i.unsigned_abs() <= MAX_SAFE_INTEGER,
                (None, None) => true,
            };
            if !exact {
                return Err(StoreError::InvalidKey(format!("integer key {n} is outside the exact range")));
            }
            let f = n
                .as_f64()
                .filter(|f| !f.is_nan())
                .ok_or_else(|| StoreError::InvalidKey(format!("unsupported number {n}")))?;
            // -0.0 and 0.0 are the same key
            let f = if f == 0.0 { 0.0 } else { f };
            out.push(TAG_NUMBER);
            out.extend_from_slice(&order_preserving_f64(f).to_be_bytes());
        },
        Value::String(s) => {
            out.push(TAG_STRING);
            if nested {
                // Escape NUL so the terminator stays unambiguous inside arrays
                for byte in s.as_bytes() {
                    out.push(*byte);
                    if *byte == END {
                        out.push(ESCAPE);
                    }
                }
                out.extend_from_slice(&[END, END]);
            } else {
                out.extend_from_slice(s.as_bytes());
            }
        },
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            for item in items {
                encode_into(item, out, true)?;
            }
            out.push(END);
        },
        Value::Null | Value::Object(_) => {
            return Err(StoreError::InvalidKey(format!("{value} is not a valid key")));
        },
    }
    Ok(())
}

fn order_preserving_f64(f: f64) -> u64 {
    let bits = f.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits ^ (1 << 63)
    }
}

/// Renders a key for error messages.
pub fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolves a dotted field path inside a document.
pub fn extract<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(doc);
    }
    path.split('.').try_fold(doc, |current, segment| current.get(segment))
}

/// Encoded index values a document contributes to `index`.
///
/// Missing, null, or non-key values contribute nothing, so the record is
/// simply not reachable through that index.
pub fn index_values(doc: &Value, index: &IndexSpec) -> Vec<Vec<u8>> {
    match &index.key_path {
        KeyPath::Single(path) => match extract(doc, path) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) if index.multi_entry => {
                let mut values: Vec<Vec<u8>> = items.iter().filter_map(|item| encode_key(item).ok()).collect();
                values.sort();
                values.dedup();
                values
            },
            Some(value) => encode_key(value).map(|v| vec![v]).unwrap_or_default(),
        },
        KeyPath::Compound(paths) => {
            let parts: Option<Vec<Value>> = paths
                .iter()
                .map(|p| extract(doc, p).filter(|v| !v.is_null()).cloned())
                .collect();
            parts
                .and_then(|parts| encode_key(&Value::Array(parts)).ok())
                .map(|v| vec![v])
                .unwrap_or_default()
        },
    }
}

/// Prefix shared by every index entry carrying `value`.
pub fn index_prefix(value: &[u8]) -> Vec<u8> {
    let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
    let mut key = Vec::with_capacity(4 + value.len());
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(value);
    key
}

/// Sled key of an index entry. Unique indexes hold one entry per value;
/// other indexes append the primary key so duplicates coexist.
pub fn index_entry_key(value: &[u8], primary_key: &[u8], unique: bool) -> Vec<u8> {
    let mut key = index_prefix(value);
    if !unique {
        key.extend_from_slice(primary_key);
    }
    key
}

/// A range over keys, modelled on the browser key-range primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    lower: Option<(Value, bool)>,
    upper: Option<(Value, bool)>,
}

impl KeyRange {
    /// Exactly one key.
    pub fn only(key: impl Into<Value>) -> Self {
        let key = key.into();
        Self {
            lower: Some((key.clone(), false)),
            upper: Some((key, false)),
        }
    }

    /// Keys greater than (or equal to, unless `open`) `key`.
    pub fn lower_bound(key: impl Into<Value>, open: bool) -> Self {
        Self {
            lower: Some((key.into(), open)),
            upper: None,
        }
    }

    /// Keys less than (or equal to, unless `open`) `key`.
    pub fn upper_bound(key: impl Into<Value>, open: bool) -> Self {
        Self {
            lower: None,
            upper: Some((key.into(), open)),
        }
    }

    /// Keys between `lower` and `upper`.
    pub fn bound(lower: impl Into<Value>, upper: impl Into<Value>, lower_open: bool, upper_open: bool) -> Self {
        Self {
            lower: Some((lower.into(), lower_open)),
            upper: Some((upper.into(), upper_open)),
        }
    }

    /// Encoded sled bounds, or `None` when the range cannot match anything.
    pub fn to_bounds(&self) -> Result<Option<(Bound<Vec<u8>>, Bound<Vec<u8>>)>> {
        let lower = match &self.lower {
            Some((key, true)) => Bound::Excluded(encode_key(key)?),
            Some((key, false)) => Bound::Included(encode_key(key)?),
            None => Bound::Unbounded,
        };
        let upper = match &self.upper {
            Some((key, true)) => Bound::Excluded(encode_key(key)?),
            Some((key, false)) => Bound::Included(encode_key(key)?),
            None => Bound::Unbounded,
        };

        let empty = match (&lower, &upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u)) | (Bound::Excluded(l), Bound::Included(u)) => l >= u,
            _ => false,
        };

        Ok(if empty { None } else { Some((lower, upper)) })
    }
}
