//! Sharded rate limiting for authentication endpoints.
//!
//! Keys (client IPs, emails) are spread over independently locked shards so
//! that concurrent requests for different clients rarely contend. Each shard
//! is a bounded LRU cache, which caps memory at
//! `shard_count * per_shard_capacity` entries no matter how many distinct
//! keys are seen.

pub mod email;
pub mod token_bucket;

use std::num::NonZeroUsize;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::cache::BoundedTtlCache;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::shard::{DEFAULT_SHARD_COUNT, ShardRouter};

pub use email::ShardedEmailRateLimiter;
pub use token_bucket::{Rate, TokenBucket};

/// Default maximum entries per shard (16 shards * 1000 = 16,000 keys).
pub const DEFAULT_MAX_ENTRIES_PER_SHARD: usize = 1000;

/// Default minimum interval between two emails to the same address.
pub const DEFAULT_EMAIL_INTERVAL: Duration = Duration::from_secs(60);

/// Rate and burst for one protected action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPreset {
    /// Refill rate.
    pub rate: Rate,
    /// Bucket capacity.
    pub burst: u32,
}

impl RateLimitPreset {
    /// Login: one attempt every 12 seconds, bursts of 5.
    pub const LOGIN: Self = Self {
        rate: Rate::every(Duration::from_secs(12)),
        burst: 5,
    };

    /// Registration: one attempt every 20 seconds, bursts of 3.
    pub const REGISTER: Self = Self {
        rate: Rate::every(Duration::from_secs(20)),
        burst: 3,
    };

    /// Password reset: one attempt every 20 seconds, bursts of 3.
    pub const RESET_PASSWORD: Self = Self {
        rate: Rate::every(Duration::from_secs(20)),
        burst: 3,
    };
}

/// A fixed set of independently locked bounded caches.
pub(crate) struct Shards<V> {
    router: ShardRouter,
    shards: Box<[Mutex<BoundedTtlCache<String, V>>]>,
}

impl<V> Shards<V> {
    pub(crate) fn new(shard_count: usize, per_shard_capacity: usize) -> Result<Self> {
        let router = ShardRouter::new(shard_count)?;
        let capacity = NonZeroUsize::new(per_shard_capacity).ok_or_else(|| {
            Error::InvalidConfig("per-shard capacity must be positive".to_string())
        })?;

        let shards = (0..shard_count)
            .map(|_| Mutex::new(BoundedTtlCache::new(capacity)))
            .collect();

        Ok(Self { router, shards })
    }

    pub(crate) fn shard(&self, key: &str) -> &Mutex<BoundedTtlCache<String, V>> {
        &self.shards[self.router.shard_of(key)]
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Sums entries across shards, holding one shard lock at a time.
    pub(crate) async fn total_len(&self) -> usize {
        let mut total = 0;
        for shard in self.shards.iter() {
            total += shard.lock().await.len();
        }
        total
    }
}

/// Per-key limiter state.
#[derive(Debug)]
struct RateLimiterEntry {
    /// `None` only if the entry was damaged; rebuilt on next access.
    bucket: Option<TokenBucket>,
    last_seen: Instant,
}

/// Token-bucket rate limiter sharded by client key.
pub struct ShardedRateLimiter {
    name: String,
    /// `None` for a pass-through limiter.
    shards: Option<Shards<RateLimiterEntry>>,
    rate: Rate,
    burst: u32,
    metrics: Option<Metrics>,
}

impl ShardedRateLimiter {
    /// Creates a limiter with the default shard count.
    ///
    /// Fails if `rate` never refills, `burst` is zero, or
    /// `per_shard_capacity` is zero.
    pub fn new(
        name: impl Into<String>,
        rate: Rate,
        burst: u32,
        per_shard_capacity: usize,
    ) -> Result<Self> {
        Self::with_shards(name, rate, burst, DEFAULT_SHARD_COUNT, per_shard_capacity)
    }

    /// Creates a limiter from a preset.
    pub fn from_preset(
        name: impl Into<String>,
        preset: RateLimitPreset,
        per_shard_capacity: usize,
    ) -> Result<Self> {
        Self::new(name, preset.rate, preset.burst, per_shard_capacity)
    }

    /// Creates a limiter with an explicit shard count (a power of two).
    pub fn with_shards(
        name: impl Into<String>,
        rate: Rate,
        burst: u32,
        shard_count: usize,
        per_shard_capacity: usize,
    ) -> Result<Self> {
        let name = name.into();
        if !rate.is_valid() {
            return Err(Error::InvalidConfig(format!(
                "rate limiter {name}: rate interval must be positive"
            )));
        }
        if burst == 0 {
            return Err(Error::InvalidConfig(format!(
                "rate limiter {name}: burst must be positive"
            )));
        }

        let shards = Shards::new(shard_count, per_shard_capacity)?;

        info!(
            limiter = %name,
            interval_ms = rate.interval().as_millis() as u64,
            burst,
            shards = shard_count,
            per_shard_capacity,
            "Sharded rate limiter created"
        );

        Ok(Self {
            name,
            shards: Some(shards),
            rate,
            burst,
            metrics: None,
        })
    }

    /// A limiter that allows every request.
    ///
    /// Stand-in for a limiter that failed to construct, so the host can keep
    /// serving in a degraded mode.
    pub fn pass_through(name: impl Into<String>) -> Self {
        let name = name.into();
        warn!(limiter = %name, "Using pass-through rate limiter");
        Self {
            name,
            shards: None,
            rate: Rate::every(Duration::ZERO),
            burst: 0,
            metrics: None,
        }
    }

    /// Attaches metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Limiter name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if this limiter allows everything.
    #[must_use]
    pub fn is_pass_through(&self) -> bool {
        self.shards.is_none()
    }

    /// Decides whether a request from `key` may proceed.
    ///
    /// An empty key is always allowed.
    pub async fn allow(&self, key: &str) -> bool {
        if key.is_empty() {
            warn!(limiter = %self.name, "Empty rate limit key, allowing request");
            return true;
        }
        let Some(shards) = &self.shards else {
            return true;
        };

        let allowed = {
            let mut shard = shards.shard(key).lock().await;
            let now = Instant::now();

            if shard.peek(key).is_none() {
                let entry = RateLimiterEntry {
                    bucket: Some(TokenBucket::new(self.rate, self.burst, now)),
                    last_seen: now,
                };
                if let Some((evicted, _)) = shard.insert(key.to_owned(), entry) {
                    trace!(limiter = %self.name, evicted = %evicted, "Evicted least recently used key");
                }
            }

            match shard.get_mut(key) {
                Some(entry) => {
                    entry.last_seen = now;
                    let bucket = entry.bucket.get_or_insert_with(|| {
                        error!(limiter = %self.name, key, "Missing token bucket, rebuilding");
                        if let Some(ref m) = self.metrics {
                            m.record_rate_limit_anomaly(&self.name);
                        }
                        TokenBucket::new(self.rate, self.burst, now)
                    });
                    bucket.try_acquire(now)
                }
                None => {
                    error!(limiter = %self.name, key, "Entry vanished after insert, allowing request");
                    true
                }
            }
        };

        if let Some(ref m) = self.metrics {
            m.record_rate_limit_decision(&self.name, allowed);
        }
        if !allowed {
            debug!(limiter = %self.name, key, "Rate limit exceeded");
        }
        allowed
    }

    /// Number of live keys across all shards.
    pub async fn stats(&self) -> usize {
        match &self.shards {
            Some(shards) => shards.total_len().await,
            None => 0,
        }
    }

    /// Number of shards (0 for a pass-through limiter).
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.as_ref().map_or(0, Shards::shard_count)
    }

    /// When `key` was last seen, if it is tracked.
    pub async fn last_seen(&self, key: &str) -> Option<Instant> {
        let shards = self.shards.as_ref()?;
        let shard = shards.shard(key).lock().await;
        shard.peek(key).map(|entry| entry.last_seen)
    }

    #[cfg(test)]
    async fn damage_entry(&self, key: &str) {
        if let Some(shards) = &self.shards {
            let mut shard = shards.shard(key).lock().await;
            if let Some(entry) = shard.get_mut(key) {
                entry.bucket = None;
            }
        }
    }
}
