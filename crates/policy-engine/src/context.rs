use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Runtime facts describing one authorization request.
///
/// Backed by a `BTreeMap` so the JSON form is canonical (sorted keys), which
/// keeps [`Context::canonical_hash`] stable across callers that build the
/// same facts in different orders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(BTreeMap<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a field by key or dotted path.
    ///
    /// A literal key (even one containing dots) wins over path traversal, so
    /// `{"a.b": 1}` and `{"a": {"b": 2}}` resolve `a.b` to `1` and `2`
    /// respectively.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(v) = self.0.get(path) {
            return Some(v);
        }
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hex SHA-256 of the canonical JSON form of this context, scoped to
    /// the policy type the caller asked about.
    pub fn canonical_hash(&self, policy_type: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(policy_type.unwrap_or("*").as_bytes());
        hasher.update([0u8]);
        // Serializing a map of JSON values cannot fail.
        let body = serde_json::to_vec(&self.0).unwrap_or_default();
        hasher.update(&body);
        hex::encode(hasher.finalize())
    }
}

impl From<BTreeMap<String, Value>> for Context {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Context {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
