//! Process-wide cache for conversation data read from disk
//!
//! Entries carry their insertion time and expire after a fixed TTL. Expiry is
//! checked on read; `purge_expired` reclaims memory for entries nobody reads.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheEntry<K, V> {
    pub key: K,
    pub value: V,
    pub inserted_at: Instant,
}

impl<K, V> CacheEntry<K, V> {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= ttl
    }
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, CacheEntry<K, V>>,
}

impl<K: Eq + Hash + Clone, V> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// The cached value, unless missing or expired
    pub fn get(&self, key: &K) -> Option<&V> {
        let entry = self.entries.get(key)?;
        if entry.is_expired(self.ttl, Instant::now()) {
            None
        } else {
            Some(&entry.value)
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        let entry = CacheEntry {
            key: key.clone(),
            value,
            inserted_at: Instant::now(),
        };
        self.entries.insert(key, entry);
    }

    pub fn invalidate(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Drop every expired entry, returning the keys that were removed
    pub fn purge_expired(&mut self) -> Vec<K> {
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .values()
            .filter(|entry| entry.is_expired(self.ttl, now))
            .map(|entry| entry.key.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
