//! Deterministic cache keys.
//!
//! A key identifies one logical call: operation name plus the canonicalized
//! argument set. Arguments are collected into a sorted map of resolved
//! values before hashing, so insertion order never matters and a default
//! supplied explicitly hashes the same as one omitted. Callers resolve
//! defaults *before* building the key.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    operation: String,
    args: BTreeMap<String, serde_json::Value>,
}

impl CacheKey {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            args: BTreeMap::new(),
        }
    }

    /// Record one resolved argument. Serialization failures collapse to
    /// JSON null; the value still participates in the digest.
    pub fn arg(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(&value).unwrap_or(serde_json::Value::Null);
        self.args.insert(name.into(), value);
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Lowercase hex SHA-256 over the operation name and the canonical
    /// JSON encoding of the argument map.
    pub fn digest(&self) -> String {
        let canonical =
            serde_json::to_string(&self.args).unwrap_or_else(|_| "{}".to_string());
        let mut hasher = Sha256::new();
        hasher.update(self.operation.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.operation, self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_ignores_argument_order() {
        let a = CacheKey::new("fetch").arg("series", "quotes").arg("code", "000001");
        let b = CacheKey::new("fetch").arg("code", "000001").arg("series", "quotes");
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn explicit_default_matches_omitted_after_resolution() {
        // A call site that omits `lookback` resolves it to 2 before
        // building the key; another passes 2 explicitly. Same digest.
        let resolved_default = 2u32;
        let omitted = CacheKey::new("fetch")
            .arg("series", "indicators")
            .arg("lookback", resolved_default);
        let explicit = CacheKey::new("fetch")
            .arg("series", "indicators")
            .arg("lookback", 2u32);
        assert_eq!(omitted.digest(), explicit.digest());
    }

    #[test]
    fn different_args_change_the_digest() {
        let a = CacheKey::new("fetch").arg("series", "quotes");
        let b = CacheKey::new("fetch").arg("series", "margin");
        let c = CacheKey::new("list").arg("series", "quotes");
        assert_ne!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn digest_is_stable_hex() {
        let key = CacheKey::new("fetch").arg("series", "quotes");
        let d1 = key.digest();
        assert_eq!(d1.len(), 64);
        assert!(d1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(d1, key.digest());
    }
}
