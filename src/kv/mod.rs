//! Typed operations over the shared key-value store.
//!
//! The store holds hashes (job and ledger records), strings with TTL (status
//! JSON, seen guards), and supports a cursored key scan by glob pattern. All
//! operations are single-key atomic; the state machine only ever writes the
//! fields it changed, which keeps concurrent disjoint-field writers safe.

pub mod memory;
pub mod rest;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::KvError;

pub use memory::MemoryKv;
pub use rest::RestKv;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Cursored key scan. Start with cursor `"0"`; iteration terminates when
    /// the returned cursor is `"0"` again. No ordering guarantee.
    async fn scan(
        &self,
        pattern: &str,
        count: u64,
        cursor: &str,
    ) -> Result<(String, Vec<String>), KvError>;

    /// All fields of a hash; empty map when the key is absent.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    /// Upsert the named fields without disturbing others.
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), KvError>;

    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    async fn del(&self, key: &str) -> Result<(), KvError>;
}

/// Read a JSON value; parse failures read as absent, never as errors.
pub async fn get_json(kv: &dyn KvStore, key: &str) -> Result<Option<Value>, KvError> {
    Ok(kv.get(key).await?.and_then(|s| serde_json::from_str(&s).ok()))
}

pub async fn set_json(
    kv: &dyn KvStore,
    key: &str,
    value: &Value,
    ttl_secs: Option<u64>,
) -> Result<(), KvError> {
    kv.set(key, &value.to_string(), ttl_secs).await
}

/// Redis-style glob match supporting `*` and `?`.
pub(crate) fn glob_match(pattern: &str, input: &str) -> bool {
    fn inner(p: &[u8], s: &[u8]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], s) || (!s.is_empty() && inner(p, &s[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &s[1..]),
            (Some(pc), Some(sc)) if pc == sc => inner(&p[1..], &s[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), input.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_prefix_patterns() {
        assert!(glob_match("zano:deposit:zano:*", "zano:deposit:zano:pid1"));
        assert!(!glob_match("zano:deposit:zano:*", "zano:deposit:fusd:pid1"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("a*c*", "abcdc"));
    }
}
