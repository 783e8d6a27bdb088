//! Bounded, expiring cache with byte-cost accounting.
//!
//! Each entry carries an explicit byte cost and its insertion time. The
//! aggregate cost never exceeds the configured budget: inserts evict
//! least-recently-used entries until the new entry fits. Independently
//! of size pressure, entries older than the maximum lifetime are evicted
//! on access. A `get` refreshes an entry's recency but never its age.
//!
//! Values larger than the whole budget are not cached at all.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

struct Entry<V> {
    value: V,
    cost: usize,
    inserted_at: Instant,
}

struct Inner<K: Hash + Eq, V> {
    store: LruCache<K, Entry<V>>,
    total_bytes: usize,
}

pub struct Cache<K: Hash + Eq + Clone, V: Clone> {
    name: String,
    max_bytes: usize,
    max_lifetime: Duration,
    inner: Mutex<Inner<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Hash + Eq + Clone, V: Clone> Cache<K, V> {
    pub fn new(name: &str, max_bytes: usize, max_lifetime: Duration) -> Self {
        Self {
            name: name.to_string(),
            max_bytes,
            max_lifetime,
            inner: Mutex::new(Inner {
                store: LruCache::unbounded(),
                total_bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert `value` under `key` with the given byte cost, evicting
    /// least-recently-used entries until it fits. Replaces any previous
    /// entry for the key.
    pub fn insert(&self, key: K, value: V, cost: usize) {
        if cost > self.max_bytes {
            warn!(
                cache = %self.name,
                cost,
                budget = self.max_bytes,
                "value exceeds the whole cache budget; not caching"
            );
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(old) = inner.store.pop(&key) {
            inner.total_bytes -= old.cost;
        }
        inner.store.put(
            key,
            Entry {
                value,
                cost,
                inserted_at: Instant::now(),
            },
        );
        inner.total_bytes += cost;

        while inner.total_bytes > self.max_bytes {
            match inner.store.pop_lru() {
                Some((_, evicted)) => {
                    inner.total_bytes -= evicted.cost;
                    debug!(cache = %self.name, freed = evicted.cost, "evicted for size");
                }
                None => break,
            }
        }
    }

    /// Look up `key`. Expired entries are removed and count as misses.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let expired = match inner.store.peek(key) {
            Some(entry) => entry.inserted_at.elapsed() > self.max_lifetime,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            if let Some(entry) = inner.store.pop(key) {
                inner.total_bytes -= entry.cost;
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        // Refresh recency without touching inserted_at
        let value = inner.store.get(key).map(|entry| entry.value.clone());
        self.hits.fetch_add(1, Ordering::Relaxed);
        value
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let entry = inner.store.pop(key)?;
        inner.total_bytes -= entry.cost;
        Some(entry.value)
    }

    /// Evict every entry past the maximum lifetime regardless of size
    /// pressure. Returns the number evicted.
    pub fn evict_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<K> = inner
            .store
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() > self.max_lifetime)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = inner.store.pop(key) {
                inner.total_bytes -= entry.cost;
            }
        }
        if !expired.is_empty() {
            debug!(cache = %self.name, evicted = expired.len(), "evicted for age");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().store.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
