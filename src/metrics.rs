//! Prometheus metrics for operational visibility.
//!
//! Metrics never carry request keys: no client IPs, email addresses, user
//! IDs or OAuth tokens appear as label values. Labels are limited to
//! limiter names, outcomes and store kinds.

use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// All metrics for the gatekeeper service.
#[derive(Clone)]
pub struct Metrics {
    /// The Prometheus registry containing all metrics.
    pub registry: Registry,

    // === Rate Limiting Metrics ===
    /// Rate limit decisions by limiter and outcome.
    pub rate_limit_decisions_total: IntCounterVec,

    /// Entries found without a bucket and rebuilt (by limiter).
    pub rate_limit_anomalies_total: IntCounterVec,

    /// Tracked keys per limiter.
    pub rate_limit_entries: IntGaugeVec,

    // === User Cache Metrics ===
    pub user_cache_hits_total: IntCounter,

    pub user_cache_misses_total: IntCounter,

    /// Current number of cached profiles.
    pub user_cache_size: IntGauge,

    /// Loader invocations by outcome.
    pub user_loads_total: IntCounterVec,

    /// Callers that received another caller's in-flight load result.
    pub user_loads_shared_total: IntCounter,

    /// Entries removed by periodic expiry.
    pub user_cache_expired_total: IntCounter,

    // === State Store Metrics ===
    /// Stored entries by kind ("oauth_state" or "pending_link").
    pub state_store_entries: IntGaugeVec,

    /// Expired entries removed by the sweeper, by kind.
    pub state_sweep_removed_total: IntCounterVec,

    // === Ban Check Metrics ===
    /// Ban checks by outcome ("clear", "banned", "error", "timeout").
    pub ban_checks_total: IntCounterVec,

    // === Server Metrics ===
    /// Timestamp when the server started (Unix seconds).
    pub server_start_time_seconds: Gauge,

    /// Server version information.
    pub server_info: IntGaugeVec,
}

impl Metrics {
    /// Create a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // === Rate Limiting Metrics ===
        let rate_limit_decisions_total = IntCounterVec::new(
            Opts::new(
                "gatekeeper_rate_limit_decisions_total",
                "Total number of rate limit decisions",
            ),
            &["limiter", "outcome"],
        )?;
        registry.register(Box::new(rate_limit_decisions_total.clone()))?;

        let rate_limit_anomalies_total = IntCounterVec::new(
            Opts::new(
                "gatekeeper_rate_limit_anomalies_total",
                "Total number of limiter entries rebuilt after being found without a bucket",
            ),
            &["limiter"],
        )?;
        registry.register(Box::new(rate_limit_anomalies_total.clone()))?;

        let rate_limit_entries = IntGaugeVec::new(
            Opts::new(
                "gatekeeper_rate_limit_entries",
                "Current number of keys tracked by each rate limiter",
            ),
            &["limiter"],
        )?;
        registry.register(Box::new(rate_limit_entries.clone()))?;

        // === User Cache Metrics ===
        let user_cache_hits_total = IntCounter::with_opts(Opts::new(
            "gatekeeper_user_cache_hits_total",
            "Total number of user cache hits",
        ))?;
        registry.register(Box::new(user_cache_hits_total.clone()))?;

        let user_cache_misses_total = IntCounter::with_opts(Opts::new(
            "gatekeeper_user_cache_misses_total",
            "Total number of user cache misses",
        ))?;
        registry.register(Box::new(user_cache_misses_total.clone()))?;

        let user_cache_size = IntGauge::with_opts(Opts::new(
            "gatekeeper_user_cache_size",
            "Current number of profiles in the user cache",
        ))?;
        registry.register(Box::new(user_cache_size.clone()))?;

        let user_loads_total = IntCounterVec::new(
            Opts::new(
                "gatekeeper_user_loads_total",
                "Total number of user profile loads",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(user_loads_total.clone()))?;

        let user_loads_shared_total = IntCounter::with_opts(Opts::new(
            "gatekeeper_user_loads_shared_total",
            "Total number of callers served by another caller's in-flight load",
        ))?;
        registry.register(Box::new(user_loads_shared_total.clone()))?;

        let user_cache_expired_total = IntCounter::with_opts(Opts::new(
            "gatekeeper_user_cache_expired_total",
            "Total number of expired profiles removed by cleanup",
        ))?;
        registry.register(Box::new(user_cache_expired_total.clone()))?;

        // === State Store Metrics ===
        let state_store_entries = IntGaugeVec::new(
            Opts::new(
                "gatekeeper_state_store_entries",
                "Current number of entries in the OAuth state store",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(state_store_entries.clone()))?;

        let state_sweep_removed_total = IntCounterVec::new(
            Opts::new(
                "gatekeeper_state_sweep_removed_total",
                "Total number of expired state store entries removed by the sweeper",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(state_sweep_removed_total.clone()))?;

        // === Ban Check Metrics ===
        let ban_checks_total = IntCounterVec::new(
            Opts::new(
                "gatekeeper_ban_checks_total",
                "Total number of ban checks by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(ban_checks_total.clone()))?;

        // === Server Metrics ===
        let server_start_time_seconds = Gauge::with_opts(Opts::new(
            "gatekeeper_server_start_time_seconds",
            "Unix timestamp when the server started",
        ))?;
        registry.register(Box::new(server_start_time_seconds.clone()))?;

        let server_info = IntGaugeVec::new(
            Opts::new(
                "gatekeeper_server_info",
                "Server version and build information",
            ),
            &["version"],
        )?;
        registry.register(Box::new(server_info.clone()))?;

        Ok(Self {
            registry,
            rate_limit_decisions_total,
            rate_limit_anomalies_total,
            rate_limit_entries,
            user_cache_hits_total,
            user_cache_misses_total,
            user_cache_size,
            user_loads_total,
            user_loads_shared_total,
            user_cache_expired_total,
            state_store_entries,
            state_sweep_removed_total,
            ban_checks_total,
            server_start_time_seconds,
            server_info,
        })
    }

    /// Initialize server startup metrics.
    pub fn init_server_info(&self, version: &str) {
        self.server_start_time_seconds.set(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        );
        self.server_info.with_label_values(&[version]).set(1);
    }

    /// Record a rate limit decision for `limiter`.
    pub fn record_rate_limit_decision(&self, limiter: &str, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "denied" };
        self.rate_limit_decisions_total
            .with_label_values(&[limiter, outcome])
            .inc();
    }

    /// Record a limiter entry that had to be rebuilt.
    pub fn record_rate_limit_anomaly(&self, limiter: &str) {
        self.rate_limit_anomalies_total
            .with_label_values(&[limiter])
            .inc();
    }

    /// Update the number of keys tracked by `limiter`.
    pub fn set_rate_limit_entries(&self, limiter: &str, count: usize) {
        self.rate_limit_entries
            .with_label_values(&[limiter])
            .set(count as i64);
    }

    pub fn record_user_cache_hit(&self) {
        self.user_cache_hits_total.inc();
    }

    pub fn record_user_cache_miss(&self) {
        self.user_cache_misses_total.inc();
    }

    /// Update user cache size.
    pub fn set_user_cache_size(&self, size: usize) {
        self.user_cache_size.set(size as i64);
    }

    /// Record a loader invocation.
    ///
    /// `outcome` should be "success", "missing", "error" or "cancelled".
    pub fn record_user_load(&self, outcome: &str) {
        self.user_loads_total.with_label_values(&[outcome]).inc();
    }

    /// Record a caller that joined an in-flight load.
    pub fn record_user_load_shared(&self) {
        self.user_loads_shared_total.inc();
    }

    /// Record profiles removed by periodic expiry.
    pub fn record_user_cache_expired(&self, count: usize) {
        self.user_cache_expired_total.inc_by(count as u64);
    }

    /// Update the number of entries of `kind` in the state store.
    pub fn set_state_store_size(&self, kind: &str, size: usize) {
        self.state_store_entries
            .with_label_values(&[kind])
            .set(size as i64);
    }

    /// Record entries of `kind` removed by a sweep.
    pub fn record_state_sweep(&self, kind: &str, removed: usize) {
        self.state_sweep_removed_total
            .with_label_values(&[kind])
            .inc_by(removed as u64);
    }

    /// Record a ban check outcome.
    pub fn record_ban_check(&self, outcome: &str) {
        self.ban_checks_total.with_label_values(&[outcome]).inc();
    }

    /// Gather all metrics for export.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
