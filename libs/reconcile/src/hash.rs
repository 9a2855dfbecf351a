//! Deterministic content hashing.

use sha2::{Digest, Sha256};

/// Digest of a JSON value, independent of object key order.
///
/// Used to derive stable object names from the content they stand for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        feed(&mut hasher, value);
        // 128 bits is plenty for names
        Self(hex::encode(&hasher.finalize()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading `len` hex characters.
    pub fn short(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

/// Streams a tagged encoding of `value` into the hasher, visiting object
/// members in key order. Strings are length-prefixed so that no two
/// distinct values share an encoding.
fn feed(hasher: &mut Sha256, value: &serde_json::Value) {
    use serde_json::Value;

    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"d");
            feed_str(hasher, &n.to_string());
        }
        Value::String(s) => {
            hasher.update(b"s");
            feed_str(hasher, s);
        }
        Value::Array(items) => {
            hasher.update(b"a");
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                feed(hasher, item);
            }
        }
        Value::Object(map) => {
            let mut members: Vec<_> = map.iter().collect();
            members.sort_unstable_by_key(|(k, _)| *k);
            hasher.update(b"o");
            hasher.update((members.len() as u64).to_be_bytes());
            for (key, member) in members {
                feed_str(hasher, key);
                feed(hasher, member);
            }
        }
    }
}

fn feed_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}
