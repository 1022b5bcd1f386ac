//! In-memory key-value store with lazy TTL expiry.
//!
//! Drives the test suite and local development; semantics mirror the REST
//! store closely enough that the watcher cannot tell them apart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::KvError;

use super::{glob_match, KvStore};

enum ValueKind {
    Str(String),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: ValueKind,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|t| t <= Instant::now())
    }
}

#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge(map: &mut HashMap<String, Entry>) {
        map.retain(|_, e| !e.expired());
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn scan(
        &self,
        pattern: &str,
        count: u64,
        cursor: &str,
    ) -> Result<(String, Vec<String>), KvError> {
        let mut map = self.inner.lock();
        Self::purge(&mut map);
        let mut keys: Vec<String> =
            map.keys().filter(|k| glob_match(pattern, k)).cloned().collect();
        keys.sort();
        let start: usize = cursor.parse().map_err(|_| {
            KvError::Protocol(format!("bad scan cursor {cursor:?}"))
        })?;
        let end = (start + count.max(1) as usize).min(keys.len());
        let batch = keys.get(start..end).unwrap_or_default().to_vec();
        let next = if end >= keys.len() { "0".to_string() } else { end.to_string() };
        Ok((next, batch))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut map = self.inner.lock();
        Self::purge(&mut map);
        match map.get(key) {
            Some(Entry { value: ValueKind::Hash(h), .. }) => Ok(h.clone()),
            _ => Ok(HashMap::new()),
        }
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError> {
        let mut map = self.inner.lock();
        Self::purge(&mut map);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: ValueKind::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            ValueKind::Hash(h) => {
                for (f, v) in fields {
                    h.insert(f.clone(), v.clone());
                }
                Ok(())
            }
            ValueKind::Str(_) => Err(KvError::Protocol(format!(
                "hset on string key {key:?}"
            ))),
        }
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut map = self.inner.lock();
        if let Some(entry) = map.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut map = self.inner.lock();
        Self::purge(&mut map);
        match map.get(key) {
            Some(Entry { value: ValueKind::Str(s), .. }) => Ok(Some(s.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), KvError> {
        let mut map = self.inner.lock();
        map.insert(
            key.to_string(),
            Entry {
                value: ValueKind::Str(value.to_string()),
                expires_at: ttl_secs.map(|t| Instant::now() + Duration::from_secs(t)),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut map = self.inner.lock();
        Self::purge(&mut map);
        Ok(map.contains_key(key))
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.inner.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_fields_upsert_without_disturbing_others() {
        let kv = MemoryKv::new();
        kv.hset("h", &[("a".into(), "1".into()), ("b".into(), "2".into())]).await.unwrap();
        kv.hset("h", &[("b".into(), "3".into())]).await.unwrap();
        let all = kv.hgetall("h").await.unwrap();
        assert_eq!(all.get("a").map(String::as_str), Some("1"));
        assert_eq!(all.get("b").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn scan_pages_through_matching_keys() {
        let kv = MemoryKv::new();
        for i in 0..7 {
            kv.set(&format!("p:deposit:zano:k{i}"), "x", None).await.unwrap();
        }
        kv.set("p:deposit:fusd:other", "x", None).await.unwrap();

        let mut cursor = "0".to_string();
        let mut seen = Vec::new();
        loop {
            let (next, keys) = kv.scan("p:deposit:zano:*", 3, &cursor).await.unwrap();
            seen.extend(keys);
            if next == "0" {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 7);
        assert!(seen.iter().all(|k| k.starts_with("p:deposit:zano:")));
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let kv = MemoryKv::new();
        kv.set("gone", "1", Some(0)).await.unwrap();
        assert!(!kv.exists("gone").await.unwrap());
        kv.set("kept", "1", Some(3600)).await.unwrap();
        assert!(kv.exists("kept").await.unwrap());
    }

    #[tokio::test]
    async fn get_on_missing_key_is_none() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("nope").await.unwrap(), None);
        assert!(kv.hgetall("nope").await.unwrap().is_empty());
    }
}
