//! User profile cache with duplicate-load suppression.
//!
//! Wraps a [`BoundedTtlCache`] behind a short mutex and adds a
//! singleflight layer: when several callers miss on the same user at once,
//! exactly one of them runs the loader and the rest wait for its result.
//! This keeps a burst of requests for a just-expired user from turning into
//! a burst of database queries.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::BoundedTtlCache;
use crate::error::{CacheError, Error, Result};
use crate::metrics::Metrics;

/// Default maximum number of cached users.
pub const DEFAULT_MAX_SIZE: usize = 1000;

/// Default time a cached user stays valid.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// Maximum entries scanned per call to [`UserCache::evict_expired`].
const CLEANUP_BATCH_SIZE: usize = 1000;

/// Outcome of one load, shared with every caller waiting on it.
type LoadOutcome<P> = std::result::Result<P, CacheError>;

/// Channel carrying the result of an in-flight load. `None` until the load
/// finishes; the sender is dropped without a value if the load is abandoned.
type FlightReceiver<P> = watch::Receiver<Option<LoadOutcome<P>>>;

/// Cache performance snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Current number of entries.
    pub size: usize,
    /// Maximum number of entries.
    pub max_size: usize,
    /// Reads served from the cache.
    pub hits: u64,
    /// Reads that found nothing usable.
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0 before any read.
    pub hit_ratio: f64,
}

/// Thread-safe LRU + TTL cache of user profiles keyed by user ID.
///
/// Every read updates recency, so the entries sit behind a mutex that is
/// never held across an `.await`.
pub struct UserCache<P> {
    entries: StdMutex<BoundedTtlCache<i64, P>>,
    in_flight: StdMutex<HashMap<i64, FlightReceiver<P>>>,
    ttl: Duration,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    metrics: Option<Metrics>,
}

/// Removes the in-flight marker for a user when the loading caller finishes
/// or is dropped mid-load.
struct FlightGuard<'a, P> {
    in_flight: &'a StdMutex<HashMap<i64, FlightReceiver<P>>>,
    user_id: i64,
}

impl<P> Drop for FlightGuard<'_, P> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.user_id);
    }
}

enum Role<P> {
    Leader(watch::Sender<Option<LoadOutcome<P>>>),
    Follower(FlightReceiver<P>),
}

impl<P: Clone + Send + Sync + 'static> UserCache<P> {
    /// Creates a cache holding at most `max_size` users for `ttl` each.
    pub fn new(max_size: usize, ttl: Duration) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_size).ok_or_else(|| {
            Error::InvalidConfig(format!("user cache max_size must be positive, got {max_size}"))
        })?;
        if ttl.is_zero() {
            return Err(Error::InvalidConfig(
                "user cache ttl must be positive".to_string(),
            ));
        }

        info!(max_size, ttl_secs = ttl.as_secs(), "User cache initialized");

        Ok(Self {
            entries: StdMutex::new(BoundedTtlCache::with_ttl(capacity, ttl)),
            in_flight: StdMutex::new(HashMap::new()),
            ttl,
            max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            metrics: None,
        })
    }

    /// Attaches metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn lock_entries(&self) -> MutexGuard<'_, BoundedTtlCache<i64, P>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_size(&self, size: usize) {
        if let Some(ref m) = self.metrics {
            m.set_user_cache_size(size);
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(ref m) = self.metrics {
            m.record_user_cache_hit();
        }
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(ref m) = self.metrics {
            m.record_user_cache_miss();
        }
    }

    /// Returns the cached profile for `user_id`, if present and fresh, and
    /// marks it most recently used.
    ///
    /// An expired entry counts as a miss and is evicted.
    pub async fn get(&self, user_id: i64) -> Option<P> {
        if user_id <= 0 {
            warn!(user_id, "Invalid user ID for cache get");
            self.record_miss();
            return None;
        }

        let (found, evicted_size) = {
            let mut entries = self.lock_entries();
            let before = entries.len();
            let found = entries.get(&user_id).cloned();
            let after = entries.len();
            (found, (after < before).then_some(after))
        };

        if let Some(size) = evicted_size {
            trace!(user_id, "Evicted expired cache entry");
            self.record_size(size);
        }

        match found {
            Some(profile) => {
                self.record_hit();
                Some(profile)
            }
            None => {
                self.record_miss();
                None
            }
        }
    }

    /// Returns the cached profile, or loads it with `loader` on a miss.
    ///
    /// Concurrent misses for the same user share one loader call and its
    /// result. A successful load is cached before anyone is released.
    /// Loader errors are returned to every waiter and never cached.
    ///
    /// If `cancel` fires first, this caller gets [`CacheError::Cancelled`].
    /// Should this caller be the one running the load, the load is abandoned
    /// and the remaining waiters start a new one.
    ///
    /// The loader must not call back into this cache for the same user.
    pub async fn get_or_load<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        loader: F,
    ) -> LoadOutcome<P>
    where
        F: FnOnce(CancellationToken, i64) -> Fut,
        Fut: Future<Output = std::result::Result<Option<P>, E>>,
        E: std::fmt::Display,
    {
        if user_id <= 0 {
            warn!(user_id, "Invalid user ID for cache load");
            return Err(CacheError::InvalidUserId(user_id));
        }

        if let Some(profile) = self.get(user_id).await {
            return Ok(profile);
        }

        loop {
            match self.join_or_lead(user_id) {
                Role::Follower(mut receiver) => {
                    let shared = tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(user_id, "Cancelled while waiting for shared load");
                            return Err(CacheError::Cancelled);
                        }
                        shared = async {
                            receiver
                                .wait_for(Option::is_some)
                                .await
                                .map(|outcome| (*outcome).clone())
                        } => shared,
                    };

                    if let Ok(Some(outcome)) = shared {
                        trace!(user_id, "Singleflight shared result");
                        if let Some(ref m) = self.metrics {
                            m.record_user_load_shared();
                        }
                        return outcome;
                    }

                    // The loading caller gave up; try again, possibly as the
                    // new loader.
                    if let Some(profile) = self.get(user_id).await {
                        return Ok(profile);
                    }
                }
                Role::Leader(sender) => return self.lead(sender, cancel, user_id, loader).await,
            }
        }
    }

    /// Runs the load for `user_id` on behalf of every waiter.
    async fn lead<F, Fut, E>(
        &self,
        sender: watch::Sender<Option<LoadOutcome<P>>>,
        cancel: &CancellationToken,
        user_id: i64,
        loader: F,
    ) -> LoadOutcome<P>
    where
        F: FnOnce(CancellationToken, i64) -> Fut,
        Fut: Future<Output = std::result::Result<Option<P>, E>>,
        E: std::fmt::Display,
    {
        // Dropping the sender without a value tells waiters to retry.
        let _guard = FlightGuard {
            in_flight: &self.in_flight,
            user_id,
        };

        // Another caller may have filled the cache while roles were decided.
        if let Some(profile) = self.get(user_id).await {
            sender.send_replace(Some(Ok(profile.clone())));
            return Ok(profile);
        }

        if cancel.is_cancelled() {
            debug!(user_id, "Cancelled before load started");
            return Err(CacheError::Cancelled);
        }

        let loaded = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(user_id, "Cancelled during load");
                self.record_load("cancelled");
                return Err(CacheError::Cancelled);
            }
            loaded = loader(cancel.clone(), user_id) => loaded,
        };

        let outcome = match loaded {
            Ok(Some(profile)) => {
                self.set(user_id, profile.clone()).await;
                self.record_load("success");
                Ok(profile)
            }
            Ok(None) => {
                warn!(user_id, "Loader returned no profile");
                self.record_load("missing");
                Err(CacheError::MissingProfile(user_id))
            }
            Err(e) => {
                warn!(user_id, error = %e, "User loader failed");
                self.record_load("error");
                Err(CacheError::LoaderFailed(e.to_string()))
            }
        };

        sender.send_replace(Some(outcome.clone()));
        outcome
    }

    /// Registers as a follower of an existing load for `user_id`, or as the
    /// leader of a new one.
    fn join_or_lead(&self, user_id: i64) -> Role<P> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(receiver) = in_flight.get(&user_id) {
            return Role::Follower(receiver.clone());
        }

        let (sender, receiver) = watch::channel(None);
        in_flight.insert(user_id, receiver);
        Role::Leader(sender)
    }

    fn record_load(&self, outcome: &str) {
        if let Some(ref m) = self.metrics {
            m.record_user_load(outcome);
        }
    }

    /// Writes `profile` into the cache, evicting the least recently used
    /// user if full.
    ///
    /// A non-positive `user_id` is ignored with a warning: cache writes are
    /// advisory and must never fail the caller.
    pub async fn set(&self, user_id: i64, profile: P) {
        if user_id <= 0 {
            warn!(user_id, "Invalid user ID for cache set");
            return;
        }

        let (evicted, size) = {
            let mut entries = self.lock_entries();
            let evicted = entries.insert(user_id, profile);
            (evicted, entries.len())
        };

        if let Some((evicted_id, _)) = evicted {
            debug!(user_id, evicted_id, "Cache full, evicted least recently used user");
        }
        self.record_size(size);
    }

    /// Drops the cached profile for `user_id`.
    pub async fn invalidate(&self, user_id: i64) {
        if user_id <= 0 {
            warn!(user_id, "Invalid user ID for cache invalidate");
            return;
        }

        let (removed, size) = {
            let mut entries = self.lock_entries();
            (entries.remove(&user_id).is_some(), entries.len())
        };
        if removed {
            info!(user_id, "Cache invalidated for user");
            self.record_size(size);
        }
    }

    /// Drops every cached profile and resets the hit/miss counters.
    pub async fn invalidate_all(&self) {
        self.lock_entries().purge();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.record_size(0);
        info!("All user cache entries invalidated");
    }

    /// Resets the hit/miss counters.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        info!("User cache statistics reset");
    }

    /// Removes expired entries, bounded per call.
    pub async fn evict_expired(&self) -> usize {
        let (evicted, size) = {
            let mut entries = self.lock_entries();
            let evicted = entries.evict_expired(CLEANUP_BATCH_SIZE);
            (evicted, entries.len())
        };
        if let Some(ref m) = self.metrics {
            m.record_user_cache_expired(evicted);
        }
        self.record_size(size);
        evicted
    }

    /// Current size, limits, and hit ratio.
    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_ratio = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        CacheStats {
            size: self.len().await,
            max_size: self.max_size,
            hits,
            misses,
            hit_ratio,
        }
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Returns `true` if nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns `true` if the cache is at capacity.
    pub async fn is_full(&self) -> bool {
        self.len().await >= self.max_size
    }

    /// Configured time-to-live.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Configured capacity.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }
}
