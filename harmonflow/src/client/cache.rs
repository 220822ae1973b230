//! Time-to-live response cache.

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Derives a deterministic cache key from an endpoint and request body.
///
/// `serde_json` maps are key-sorted, so logically equal requests hash
/// equally regardless of how their fields were inserted.
#[must_use]
pub fn request_key(endpoint: &str, request: &Value) -> String {
    let body = serde_json::to_string(request).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.as_bytes());
    let digest = hasher.finalize();
    format!("req:{}", hex::encode(&digest[..16]))
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
    inserted_at: Instant,
}

/// A bounded cache whose entries expire after a fixed TTL.
///
/// When full, inserting evicts expired entries first, then the oldest one.
#[derive(Debug)]
pub struct TtlCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TtlCache {
    /// Creates a cache. A zero `ttl` or `capacity` disables caching.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns true if the cache stores nothing.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.ttl.is_zero() || self.capacity == 0
    }

    /// Gets a live entry, counting a hit or a miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            entries.remove(key);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Gets a live entry without touching the counters.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    /// Stores a value.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        if self.is_disabled() {
            return;
        }
        let key = key.into();
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
                inserted_at: now,
            },
        );
    }

    /// Removes every entry. Counters are kept.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cache hits so far.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses so far.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_key_is_order_independent() {
        let mut a = serde_json::Map::new();
        a.insert("id".to_string(), json!("P1"));
        a.insert("db".to_string(), json!("uniprot"));
        let b = json!({"db": "uniprot", "id": "P1"});

        assert_eq!(request_key("map", &Value::Object(a)), request_key("map", &b));
        assert_ne!(request_key("map", &b), request_key("search", &b));
        assert!(request_key("map", &b).starts_with("req:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = TtlCache::new(Duration::from_secs(60), 10);
        cache.insert("k", json!(1));

        assert_eq!(cache.get("k"), Some(json!(1)));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("k"), None);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("a", json!(1));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert("b", json!(2));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert("c", json!(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.peek("a").is_none());
        assert_eq!(cache.peek("c"), Some(json!(3)));
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = TtlCache::new(Duration::ZERO, 10);
        cache.insert("k", json!(1));
        assert!(cache.is_empty());
        assert!(cache.get("k").is_none());
        assert_eq!(cache.misses(), 1);
    }
}
