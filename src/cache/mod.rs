//! Keyed, TTL + size-bounded memoization.
//!
//! Three named caches (`conversation`, `code`, `execution`) share one
//! implementation. Each cache is guarded by a single mutex so a read can
//! never observe a half-evicted entry, and eviction happens synchronously on
//! insert: a cache never exceeds its configured capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{CachePolicy, CacheSettings, EvictionPolicy};

struct Entry {
    value: serde_json::Value,
    created_at: Instant,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Eviction order: front is next to go. For LRU a hit moves the key to
    /// the back; for FIFO insertion order is never touched.
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Counters for one named cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// One named cache.
pub struct Cache {
    name: &'static str,
    policy: CachePolicy,
    inner: Mutex<Inner>,
}

impl Cache {
    pub fn new(name: &'static str, policy: CachePolicy) -> Self {
        Self {
            name,
            policy,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Look up a value. Expired entries count as misses and are removed.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.expires_at <= Instant::now(),
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
            inner.misses += 1;
            return None;
        }

        if self.policy.eviction == EvictionPolicy::Lru {
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(pos);
                inner.order.push_back(key.to_string());
            }
        }

        let value = inner.entries.get(key).map(|e| e.value.clone());
        match value.and_then(|v| serde_json::from_value(v).ok()) {
            Some(v) => {
                inner.hits += 1;
                Some(v)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert a value, evicting synchronously if the cache is at capacity.
    pub fn insert<T: Serialize>(&self, key: &str, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(cache = self.name, error = %e, "Unserializable cache value dropped");
                return;
            }
        };

        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();

        if inner.entries.contains_key(key) {
            // Replacing keeps FIFO age; LRU treats a write as a touch.
            if self.policy.eviction == EvictionPolicy::Lru {
                inner.order.retain(|k| k != key);
                inner.order.push_back(key.to_string());
            }
        } else {
            while inner.entries.len() >= self.policy.max_entries.max(1) {
                if let Some(victim) = inner.order.pop_front() {
                    inner.entries.remove(&victim);
                    inner.evictions += 1;
                    tracing::trace!(cache = self.name, key = %victim, "Evicted cache entry");
                } else {
                    break;
                }
            }
            inner.order.push_back(key.to_string());
        }

        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at: now,
                expires_at: now + self.policy.ttl,
            },
        );
    }

    /// Remove one entry.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.remove(key);
        inner.order.retain(|k| k != key);
    }

    /// Bulk-clear the cache.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of an entry, if present and unexpired. Mainly for diagnostics.
    pub fn entry_age(&self, key: &str) -> Option<std::time::Duration> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.created_at.elapsed())
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

/// The three named caches the workflow uses.
pub struct CacheLayer {
    pub conversation: Cache,
    pub code: Cache,
    pub execution: Cache,
}

impl CacheLayer {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            conversation: Cache::new("conversation", settings.conversation),
            code: Cache::new("code", settings.code),
            execution: Cache::new("execution", settings.execution),
        }
    }

    /// Bulk-clear everything.
    pub fn clear_all(&self) {
        self.conversation.clear();
        self.code.clear();
        self.execution.clear();
    }
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new(&CacheSettings::default())
    }
}

/// Stable cache key for any serializable value.
pub fn cache_key<T: Serialize>(value: &T) -> String {
    use std::hash::{Hash, Hasher};
    let serialized = serde_json::to_string(value).unwrap_or_default();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    serialized.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn policy(max_entries: usize, eviction: EvictionPolicy) -> CachePolicy {
        CachePolicy {
            ttl: Duration::from_secs(60),
            max_entries,
            eviction,
        }
    }

    #[test]
    fn get_and_insert_roundtrip() {
        let cache = Cache::new("test", policy(8, EvictionPolicy::Lru));
        cache.insert("k", &"value".to_string());
        assert_eq!(cache.get::<String>("k").as_deref(), Some("value"));
        assert_eq!(cache.get::<String>("missing"), None);
    }

    #[test]
    fn capacity_never_exceeded() {
        let cache = Cache::new("test", policy(3, EvictionPolicy::Lru));
        for i in 0..4 {
            cache.insert(&format!("k{}", i), &i);
        }
        // Inserting N+1 entries into a max-size-N cache: exactly one eviction.
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache = Cache::new("test", policy(2, EvictionPolicy::Lru));
        cache.insert("a", &1);
        cache.insert("b", &2);
        // Touch "a" so "b" becomes the LRU victim.
        assert_eq!(cache.get::<i32>("a"), Some(1));
        cache.insert("c", &3);

        assert_eq!(cache.get::<i32>("a"), Some(1));
        assert_eq!(cache.get::<i32>("b"), None);
        assert_eq!(cache.get::<i32>("c"), Some(3));
    }

    #[test]
    fn fifo_evicts_oldest_insert() {
        let cache = Cache::new("test", policy(2, EvictionPolicy::Fifo));
        cache.insert("a", &1);
        cache.insert("b", &2);
        // A hit does not protect "a" under FIFO.
        assert_eq!(cache.get::<i32>("a"), Some(1));
        cache.insert("c", &3);

        assert_eq!(cache.get::<i32>("a"), None);
        assert_eq!(cache.get::<i32>("b"), Some(2));
    }

    #[test]
    fn ttl_expiry_is_a_miss() {
        let cache = Cache::new(
            "test",
            CachePolicy {
                ttl: Duration::ZERO,
                max_entries: 8,
                eviction: EvictionPolicy::Lru,
            },
        );
        cache.insert("k", &1);
        assert_eq!(cache.get::<i32>("k"), None);
        // Entry was removed lazily.
        assert!(cache.is_empty());
    }

    #[test]
    fn replacing_a_key_does_not_evict() {
        let cache = Cache::new("test", policy(2, EvictionPolicy::Lru));
        cache.insert("a", &1);
        cache.insert("b", &2);
        cache.insert("a", &10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get::<i32>("a"), Some(10));
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = Cache::new("test", policy(8, EvictionPolicy::Lru));
        cache.insert("k", &1);
        cache.get::<i32>("k");
        cache.get::<i32>("nope");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn cache_key_is_stable() {
        #[derive(serde::Serialize)]
        struct Key<'a> {
            a: &'a str,
            b: u32,
        }
        let k1 = cache_key(&Key { a: "x", b: 1 });
        let k2 = cache_key(&Key { a: "x", b: 1 });
        let k3 = cache_key(&Key { a: "y", b: 1 });
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn layer_clear_all() {
        let layer = CacheLayer::default();
        layer.conversation.insert("k", &1);
        layer.code.insert("k", &2);
        layer.execution.insert("k", &3);
        layer.clear_all();
        assert!(layer.conversation.is_empty());
        assert!(layer.code.is_empty());
        assert!(layer.execution.is_empty());
    }

    #[test]
    fn concurrent_inserts_stay_bounded() {
        use std::sync::Arc;
        let cache = Arc::new(Cache::new("test", policy(16, EvictionPolicy::Fifo)));
        let mut handles = Vec::new();
        for t in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    cache.insert(&format!("t{}-{}", t, i), &i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.len() <= 16);
    }
}
