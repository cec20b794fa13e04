//! Token bucket used by the request rate limiter.

use std::time::Duration;

use tokio::time::Instant;

/// Refill rate of a token bucket, expressed as the time to earn one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    interval: Duration,
}

impl Rate {
    /// One token every `interval`.
    #[must_use]
    pub const fn every(interval: Duration) -> Self {
        Self { interval }
    }

    /// `tokens` tokens per second.
    ///
    /// Returns `None` for non-finite or non-positive rates.
    #[must_use]
    pub fn per_second(tokens: f64) -> Option<Self> {
        if !tokens.is_finite() || tokens <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(1.0 / tokens)
            .ok()
            .map(Self::every)
    }

    /// Time needed to earn one token.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns `true` if this rate ever produces tokens.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.interval.is_zero()
    }
}

/// Continuously refilling token bucket.
///
/// Holds up to `burst` tokens and earns one token per `rate` interval.
/// Refill uses whole-token integer arithmetic and carries the unspent
/// fraction of an interval forward, so it never drifts.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: u32,
    burst: u32,
    interval_nanos: u128,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// `rate` must be valid and `burst` non-zero; the limiter checks both
    /// before building buckets.
    pub fn new(rate: Rate, burst: u32, now: Instant) -> Self {
        Self {
            tokens: burst,
            burst,
            interval_nanos: rate.interval.as_nanos().max(1),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.tokens >= self.burst {
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        let earned = elapsed / self.interval_nanos;
        if earned == 0 {
            return;
        }

        let missing = u128::from(self.burst - self.tokens);
        if earned >= missing {
            self.tokens = self.burst;
            self.last_refill = now;
        } else {
            // earned < missing <= u32::MAX
            self.tokens += earned as u32;
            let spent = earned * self.interval_nanos;
            self.last_refill += Duration::from_nanos(spent as u64);
        }
    }

    /// Takes one token if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }

    /// Tokens available at `now`, without consuming any.
    pub fn available(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_constructors() {
        assert_eq!(
            Rate::every(Duration::from_secs(12)).interval(),
            Duration::from_secs(12)
        );
        assert_eq!(
            Rate::per_second(4.0).unwrap().interval(),
            Duration::from_millis(250)
        );
        assert!(Rate::per_second(0.0).is_none());
        assert!(Rate::per_second(-1.0).is_none());
        assert!(Rate::per_second(f64::NAN).is_none());
        assert!(!Rate::every(Duration::ZERO).is_valid());
    }

    #[test]
    fn test_burst_then_deny() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(Rate::every(Duration::from_secs(12)), 5, now);

        for _ in 0..5 {
            assert!(bucket.try_acquire(now));
        }
        assert!(!bucket.try_acquire(now));
    }

    #[test]
    fn test_refill_one_token_per_interval() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(Rate::every(Duration::from_secs(12)), 5, start);
        for _ in 0..5 {
            assert!(bucket.try_acquire(start));
        }

        let later = start + Duration::from_secs(12);
        assert!(bucket.try_acquire(later));
        assert!(!bucket.try_acquire(later));
    }

    #[test]
    fn test_partial_interval_carries_over() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(Rate::every(Duration::from_secs(10)), 2, start);
        assert!(bucket.try_acquire(start));
        assert!(bucket.try_acquire(start));

        // 15s: one token earned, 5s carried.
        let t1 = start + Duration::from_secs(15);
        assert!(bucket.try_acquire(t1));
        assert!(!bucket.try_acquire(t1));

        // 20s: the carried 5s completes the second token.
        let t2 = start + Duration::from_secs(20);
        assert!(bucket.try_acquire(t2));
    }

    #[test]
    fn test_never_exceeds_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(Rate::every(Duration::from_secs(1)), 3, start);
        assert!(bucket.try_acquire(start));

        let much_later = start + Duration::from_secs(3600);
        assert_eq!(bucket.available(much_later), 3);
    }
}
