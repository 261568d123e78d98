//! Time-bounded cache.
//!
//! Entries expire `ttl` after insertion. Expiry is checked lazily on read;
//! [`TtlCache::purge_expired`] reclaims memory and is driven by the server's
//! janitor task. There is no size bound.

use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

impl<V> CacheEntry<V> {
    #[inline]
    fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < ttl
    }
}

/// Concurrent map from key to value with a per-cache lifetime.
#[derive(Debug)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    ttl: Duration,
    entries: DashMap<K, CacheEntry<V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether `key` has a fresh entry.
    pub fn has(&self, key: &K) -> bool {
        self.has_at(key, Instant::now())
    }

    pub fn has_at(&self, key: &K, now: Instant) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.is_fresh(self.ttl, now))
    }

    /// Fresh value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Value for `key` if it was inserted less than `ttl` before `now`.
    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.is_fresh(self.ttl, now) {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Store `value`, replacing any entry and restarting its lifetime.
    pub fn set(&self, key: K, value: V) {
        self.set_at(key, value, Instant::now());
    }

    /// Store `value` as if inserted at `now`.
    pub fn set_at(&self, key: K, value: V, now: Instant) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
            },
        );
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.is_fresh(ttl, now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
