//! Cache key layout and cache payloads.
//!
//! Keys are a persisted convention shared by every process using the same
//! remote cache:
//!
//! - entity rows: `<TypeFingerprint><PrimaryKey>`
//! - cached query lists: `<IndexName>:<ArgsFingerprint>`

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tierdb_core::{Error, Result, Value};

/// What a cache key holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheEntry {
    /// Non-key column values in schema order.
    Row(Vec<Value>),
    /// Tombstone: storage had no row for this id.
    Missing,
    /// Ordered id list of a cached query.
    Ids(Vec<u64>),
}

impl CacheEntry {
    /// Serialize for the remote tier.
    #[allow(clippy::result_large_err)]
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }

    /// Deserialize a remote-tier payload.
    #[allow(clippy::result_large_err)]
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(Error::from)
    }
}

/// Key of one entity row.
pub fn entity_key(fingerprint: &str, id: u64) -> String {
    format!("{}{}", fingerprint, id)
}

/// Key of one cached query list.
///
/// The argument fingerprint also covers the entity fingerprint, so a
/// layout change retires cached lists together with cached rows.
pub fn index_key(fingerprint: &str, index: &str, args: &[Value]) -> String {
    format!("{}:{}", index, args_fingerprint(fingerprint, args))
}

/// Stable hash of a search argument tuple.
pub fn args_fingerprint(fingerprint: &str, args: &[Value]) -> String {
    let normalized: Vec<Value> = args.iter().map(Value::normalized).collect();
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update([0]);
    match serde_json::to_vec(&normalized) {
        Ok(bytes) => hasher.update(&bytes),
        Err(_) => {
            for value in &normalized {
                hasher.update(format!("{:?}", value).as_bytes());
            }
        }
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_key_layout() {
        assert_eq!(entity_key("a1b2c3d4", 42), "a1b2c3d442");
    }

    #[test]
    fn index_key_layout() {
        let key = index_key("a1b2c3d4", "IndexAge", &[Value::Int(10)]);
        let (name, fp) = key.split_once(':').unwrap();
        assert_eq!(name, "IndexAge");
        assert_eq!(fp.len(), 16);
    }

    #[test]
    fn args_fingerprint_ignores_integer_width_but_not_value() {
        let a = args_fingerprint("fp", &[Value::Int(10)]);
        let b = args_fingerprint("fp", &[Value::BigInt(10)]);
        let c = args_fingerprint("fp", &[Value::BigInt(18)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, args_fingerprint("other", &[Value::Int(10)]));
    }

    #[test]
    fn payloads_decode_back() {
        let entry = CacheEntry::Row(vec![Value::Text("ann".into()), Value::Int(3)]);
        let raw = entry.encode().unwrap();
        assert_eq!(CacheEntry::decode(&raw).unwrap(), entry);
        assert!(CacheEntry::decode("not json").is_err());
    }
}
