//! Bounded, time-expiring memoization for resolver results.
//!
//! Reads go through a sharded [`DashMap`], so concurrent lookups from many
//! sessions do not serialize on one lock. Two callers that miss the same key
//! at the same moment both compute the value and the later `put` wins; the
//! cache makes no single-flight promise.

use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tracing::trace;

/// Default time-to-live for cached resolutions.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Default maximum number of cached entries.
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Concurrent map whose entries expire after a per-entry TTL.
///
/// An expired entry is never returned: a lookup that finds one removes it
/// and reports a miss.
#[derive(Debug)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, CacheEntry<V>>,
    capacity: usize,
    default_ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    /// Look up `key`, returning a clone of the live value.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        self.entries
            .remove_if(key, |_, entry| entry.is_expired(now));
        trace!("Expired cache entry removed");
        None
    }

    /// Insert `value` under `key` with the default TTL.
    pub fn insert(&self, key: K, value: V) {
        self.put(key, value, self.default_ttl);
    }

    /// Insert `value` under `key`, expiring after `ttl`.
    ///
    /// When the cache is full, expired entries are purged first and then the
    /// oldest entry is evicted.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.purge_expired();
            while self.entries.len() >= self.capacity {
                if !self.evict_oldest() {
                    break;
                }
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Drop `key` if present.
    pub fn remove(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Remove every expired entry.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    /// Number of stored entries, including any not yet purged after expiry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().inserted_at)
            .map(|entry| entry.key().clone());
        match oldest {
            Some(key) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn returns_live_entries() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        cache.insert("fmt".to_string(), 1);
        assert_eq!(cache.get(&"fmt".to_string()), Some(1));
        assert_eq!(cache.get(&"os".to_string()), None);
    }

    #[test]
    fn expired_entries_are_never_returned() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        cache.put("fmt".to_string(), 1, Duration::ZERO);

        assert_eq!(cache.get(&"fmt".to_string()), None);
        assert!(
            cache.is_empty(),
            "expired entry should be removed on access"
        );
    }

    #[test]
    fn later_put_wins() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        cache.insert("k".to_string(), 1);
        cache.insert("k".to_string(), 2);
        assert_eq!(cache.get(&"k".to_string()), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_evicts_oldest_entry() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b", 2);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn full_cache_prefers_dropping_expired_entries() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.put("stale", 0, Duration::ZERO);
        cache.insert("fresh", 1);
        cache.insert("new", 2);

        assert_eq!(cache.get(&"fresh"), Some(1));
        assert_eq!(cache.get(&"new"), Some(2));
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let cache = Arc::new(TtlCache::new(1024, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.insert(i, t);
                        assert!(cache.get(&i).is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 100);
    }
}
