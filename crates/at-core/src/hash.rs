//! Content hashing over canonical JSON
//!
//! Record ids and judgment cache keys must not depend on object key order,
//! so values are hashed through a key-sorted encoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// BLAKE3 digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    #[inline]
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Digest of the canonical encoding of `value`
    #[must_use]
    pub fn of_json(value: &Value) -> Self {
        Self::compute(canonical_json(value).as_bytes())
    }

    /// Digest of several values, each framed by its length
    #[must_use]
    pub fn of_json_parts(parts: &[&Value]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            let encoded = canonical_json(part);
            hasher.update(&(encoded.len() as u64).to_le_bytes());
            hasher.update(encoded.as_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Digest mapped uniformly onto `[0, 1)`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn unit_fraction(&self) -> f64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        (u64::from_le_bytes(head) >> 11) as f64 / (1u64 << 53) as f64
    }

    /// First 8 bytes as 16 hex chars
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// JSON encoding with object keys sorted at every depth
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(val, out);
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn short_is_sixteen_hex_chars() {
        let hash = ContentHash::of_json(&json!({"a": 1}));
        assert_eq!(hash.short().len(), 16);
        assert!(hash.to_string().starts_with(&hash.short()));
    }

    #[test]
    fn canonical_sorts_nested_keys() {
        let value = json!({"b": {"y": 1, "x": [ {"d": 1, "c": 2} ]}, "a": "s"});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":"s","b":{"x":[{"c":2,"d":1}],"y":1}}"#
        );
    }

    #[test]
    fn parts_are_framed() {
        let a = ContentHash::of_json_parts(&[&json!("ab"), &json!("c")]);
        let b = ContentHash::of_json_parts(&[&json!("a"), &json!("bc")]);
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn unit_fraction_stays_below_one(n in any::<i64>()) {
            let fraction = ContentHash::of_json(&json!(n)).unit_fraction();
            prop_assert!((0.0..1.0).contains(&fraction));
        }

        #[test]
        fn key_order_does_not_change_digest(
            entries in proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..8)
        ) {
            let forward: serde_json::Map<String, Value> =
                entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let mut reversed = serde_json::Map::new();
            for (k, v) in entries.iter().rev() {
                reversed.insert(k.clone(), json!(v));
            }
            prop_assert_eq!(
                ContentHash::of_json(&Value::Object(forward)),
                ContentHash::of_json(&Value::Object(reversed))
            );
        }
    }
}
