//! Cooldown-based limiter for outgoing email, keyed by address.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{DEFAULT_MAX_ENTRIES_PER_SHARD, Shards};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::shard::DEFAULT_SHARD_COUNT;

const LIMITER_NAME: &str = "email";

/// Sharded per-address email cooldown.
///
/// A send is allowed when at least `interval` has passed since the last
/// allowed send to the same address. Denied attempts do not restart the
/// cooldown. Unlike [`ShardedRateLimiter`](super::ShardedRateLimiter), an
/// empty address is denied: every allowed call triggers a real email.
pub struct ShardedEmailRateLimiter {
    shards: Shards<Instant>,
    interval: Duration,
    metrics: Option<Metrics>,
}

impl ShardedEmailRateLimiter {
    /// Creates a limiter with default sharding and capacity.
    pub fn new(interval: Duration) -> Result<Self> {
        Self::with_capacity(interval, DEFAULT_SHARD_COUNT, DEFAULT_MAX_ENTRIES_PER_SHARD)
    }

    /// Creates a limiter with explicit sharding and per-shard capacity.
    pub fn with_capacity(
        interval: Duration,
        shard_count: usize,
        per_shard_capacity: usize,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::InvalidConfig(
                "email interval must be positive".to_string(),
            ));
        }
        let shards = Shards::new(shard_count, per_shard_capacity)?;

        info!(
            interval_secs = interval.as_secs(),
            shards = shard_count,
            per_shard_capacity,
            "Sharded email rate limiter created"
        );

        Ok(Self {
            shards,
            interval,
            metrics: None,
        })
    }

    /// Attaches metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Minimum time between two sends to one address.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Decides whether an email may be sent to `email` now, and if so starts
    /// a new cooldown.
    pub async fn allow(&self, email: &str) -> bool {
        if email.is_empty() {
            warn!("Empty email, denying request");
            self.record(false);
            return false;
        }

        let allowed = {
            let mut shard = self.shards.shard(email).lock().await;
            let now = Instant::now();

            let cooling_down = shard
                .get(email)
                .is_some_and(|last_sent| now.duration_since(*last_sent) < self.interval);

            if !cooling_down {
                shard.insert(email.to_owned(), now);
            }
            !cooling_down
        };

        if !allowed {
            debug!("Email cooldown active");
        }
        self.record(allowed);
        allowed
    }

    /// Whole seconds until `email` may receive another message, rounded up.
    ///
    /// Returns 0 when a send would be allowed now, or for an empty address.
    pub async fn wait_time(&self, email: &str) -> u64 {
        if email.is_empty() {
            return 0;
        }

        let shard = self.shards.shard(email).lock().await;
        let Some(last_sent) = shard.peek(email) else {
            return 0;
        };

        let elapsed = last_sent.elapsed();
        if elapsed >= self.interval {
            return 0;
        }

        let remaining = self.interval - elapsed;
        remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
    }

    /// Number of tracked addresses across all shards.
    pub async fn stats(&self) -> usize {
        self.shards.total_len().await
    }

    fn record(&self, allowed: bool) {
        if let Some(ref m) = self.metrics {
            m.record_rate_limit_decision(LIMITER_NAME, allowed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cooldown_cycle() {
        tokio::time::pause();
        let limiter = ShardedEmailRateLimiter::new(Duration::from_secs(60)).unwrap();

        assert!(limiter.allow("a@b.com").await);
        assert!(!limiter.allow("a@b.com").await);

        let wait = limiter.wait_time("a@b.com").await;
        assert!(wait > 0 && wait <= 60, "wait = {wait}");

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.wait_time("a@b.com").await, 0);
        assert!(limiter.allow("a@b.com").await);
    }

    #[tokio::test]
    async fn test_denial_does_not_reset_cooldown() {
        tokio::time::pause();
        let limiter = ShardedEmailRateLimiter::new(Duration::from_secs(60)).unwrap();

        assert!(limiter.allow("user@example.com").await);
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(!limiter.allow("user@example.com").await);
        assert_eq!(limiter.wait_time("user@example.com").await, 15);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(limiter.allow("user@example.com").await);
    }

    #[tokio::test]
    async fn test_wait_time_rounds_up() {
        tokio::time::pause();
        let limiter = ShardedEmailRateLimiter::new(Duration::from_secs(60)).unwrap();

        assert!(limiter.allow("x@y.org").await);
        tokio::time::advance(Duration::from_millis(59_500)).await;
        assert_eq!(limiter.wait_time("x@y.org").await, 1);
    }

    #[tokio::test]
    async fn test_empty_email_fails_closed() {
        let limiter = ShardedEmailRateLimiter::new(Duration::from_secs(60)).unwrap();
        assert!(!limiter.allow("").await);
        assert!(!limiter.allow("").await);
        assert_eq!(limiter.wait_time("").await, 0);
        assert_eq!(limiter.stats().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_email_has_no_wait() {
        let limiter = ShardedEmailRateLimiter::new(Duration::from_secs(60)).unwrap();
        assert_eq!(limiter.wait_time("nobody@example.com").await, 0);
    }

    #[tokio::test]
    async fn test_addresses_are_independent() {
        let limiter = ShardedEmailRateLimiter::new(Duration::from_secs(60)).unwrap();
        assert!(limiter.allow("one@example.com").await);
        assert!(limiter.allow("two@example.com").await);
        assert!(!limiter.allow("one@example.com").await);
        assert_eq!(limiter.stats().await, 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_address() {
        let limiter =
            ShardedEmailRateLimiter::with_capacity(Duration::from_secs(60), 1, 2).unwrap();
        assert!(limiter.allow("a@x.io").await);
        assert!(limiter.allow("b@x.io").await);
        assert!(limiter.allow("c@x.io").await);
        assert_eq!(limiter.stats().await, 2);

        // "a" fell out of the cache and is allowed again.
        assert!(limiter.allow("a@x.io").await);
    }

    #[test]
    fn test_rejects_zero_interval() {
        assert!(ShardedEmailRateLimiter::new(Duration::ZERO).is_err());
        assert!(ShardedEmailRateLimiter::with_capacity(Duration::from_secs(1), 16, 0).is_err());
    }

    #[tokio::test]
    async fn test_decision_metrics() {
        let metrics = Metrics::new().unwrap();
        let limiter = ShardedEmailRateLimiter::new(Duration::from_secs(60))
            .unwrap()
            .with_metrics(metrics.clone());

        limiter.allow("a@b.com").await;
        limiter.allow("a@b.com").await;
        limiter.allow("").await;

        let decisions = &metrics.rate_limit_decisions_total;
        assert_eq!(decisions.with_label_values(&["email", "allowed"]).get(), 1);
        assert_eq!(decisions.with_label_values(&["email", "denied"]).get(), 2);
    }
}
