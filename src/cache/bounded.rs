//! Fixed-capacity LRU cache with per-entry insertion timestamps.
//!
//! This is the building block under both the sharded limiters and the user
//! cache. It is not synchronized: owners wrap it in their own lock.

use std::borrow::Borrow;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

/// A cached value together with the moment it was written.
#[derive(Debug, Clone)]
struct Stamped<V> {
    value: V,
    inserted_at: Instant,
}

/// Strict-LRU cache with an optional time-to-live.
///
/// When a TTL is set, an entry whose age has reached the TTL is reported
/// absent by every read; `get` also removes it.
#[derive(Debug)]
pub struct BoundedTtlCache<K: Hash + Eq, V> {
    entries: LruCache<K, Stamped<V>>,
    ttl: Option<Duration>,
}

impl<K: Hash + Eq, V> BoundedTtlCache<K, V> {
    /// Creates a cache holding at most `capacity` entries, without expiry.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            ttl: None,
        }
    }

    /// Creates a cache holding at most `capacity` entries that expire `ttl`
    /// after insertion.
    pub fn with_ttl(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(capacity),
            ttl: Some(ttl),
        }
    }

    fn is_expired(&self, inserted_at: Instant) -> bool {
        self.ttl.is_some_and(|ttl| inserted_at.elapsed() >= ttl)
    }

    /// Returns the value for `key`, marking it most recently used.
    ///
    /// Expired entries are removed and reported as absent.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_mut(key).map(|value| &*value)
    }

    /// Mutable variant of [`get`](Self::get).
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let inserted_at = self.entries.peek(key)?.inserted_at;
        if self.is_expired(inserted_at) {
            self.entries.pop(key);
            return None;
        }
        self.entries.get_mut(key).map(|entry| &mut entry.value)
    }

    /// Returns the value for `key` without touching its recency.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.peek(key)?;
        if self.is_expired(entry.inserted_at) {
            return None;
        }
        Some(&entry.value)
    }

    /// Marks `key` as most recently used, if present.
    pub fn touch<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.promote(key);
    }

    /// When `key` was last written, regardless of expiry.
    pub fn inserted_at<Q>(&self, key: &Q) -> Option<Instant>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.peek(key).map(|entry| entry.inserted_at)
    }

    /// Inserts `value` under `key`, stamping it with the current time.
    ///
    /// Returns the least recently used entry if it had to be evicted to make
    /// room. Overwriting an existing key evicts nothing.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let replacing = self.entries.contains(&key);
        let displaced = self.entries.push(
            key,
            Stamped {
                value,
                inserted_at: Instant::now(),
            },
        );
        if replacing {
            return None;
        }
        displaced.map(|(key, entry)| (key, entry.value))
    }

    /// Removes `key`, returning its value (even if expired).
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.pop(key).map(|entry| entry.value)
    }

    /// Number of stored entries, including expired ones not yet removed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Configured time-to-live, if any.
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Removes every entry.
    pub fn purge(&mut self) {
        self.entries.clear();
    }
}

impl<K: Hash + Eq + Clone, V> BoundedTtlCache<K, V> {
    /// Removes expired entries, scanning at most `batch` entries starting
    /// from the least recently used end.
    ///
    /// Returns the number of entries removed. Does nothing without a TTL.
    pub fn evict_expired(&mut self, batch: usize) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let now = Instant::now();

        let expired: Vec<K> = self
            .entries
            .iter()
            .rev()
            .take(batch)
            .filter(|(_, entry)| now.duration_since(entry.inserted_at) >= ttl)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }
}
