//! Assembly of the request-path components from configuration.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::ban::{BanCheck, BanDecision, DEFAULT_BAN_CHECK_TIMEOUT};
use crate::cache::user::{DEFAULT_MAX_SIZE, DEFAULT_TTL};
use crate::cache::{CacheStats, UserCache};
use crate::config::AppConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::profile::UserProfile;
use crate::rate_limiter::{
    DEFAULT_EMAIL_INTERVAL, DEFAULT_MAX_ENTRIES_PER_SHARD, Rate, ShardedEmailRateLimiter,
    ShardedRateLimiter,
};
use crate::shard::DEFAULT_SHARD_COUNT;
use crate::state_store::{DEFAULT_STATE_TTL, DEFAULT_SWEEP_INTERVAL, StateStore};

/// Protected actions with their own request limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Login,
    Register,
    ResetPassword,
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Register => "register",
            Self::ResetPassword => "reset_password",
        }
    }
}

/// Snapshot served on the stats endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardStats {
    pub login_entries: usize,
    pub register_entries: usize,
    pub reset_password_entries: usize,
    pub email_entries: usize,
    pub user_cache: CacheStats,
    pub oauth_states: usize,
    pub pending_links: usize,
}

/// Every in-process guard an auth backend consults on the request path.
pub struct Guard {
    login: ShardedRateLimiter,
    register: ShardedRateLimiter,
    reset_password: ShardedRateLimiter,
    email: ShardedEmailRateLimiter,
    users: Arc<UserCache<UserProfile>>,
    ban: BanCheck<UserProfile>,
    states: Arc<StateStore>,
    metrics: Option<Metrics>,
}

impl Guard {
    /// Builds every component and starts the state store sweeper.
    ///
    /// A request limiter that fails to build is replaced by a pass-through
    /// limiter. The email limiter, user cache and state store fall back to
    /// their default settings. Must be called inside a Tokio runtime.
    pub fn build(config: &AppConfig, metrics: Option<Metrics>) -> Result<Self> {
        let rl = &config.rate_limit;

        let login = request_limiter(
            Action::Login,
            rl.login_interval_secs,
            rl.login_burst,
            rl.shard_count,
            rl.per_shard_capacity,
            metrics.as_ref(),
        );
        let register = request_limiter(
            Action::Register,
            rl.register_interval_secs,
            rl.register_burst,
            rl.shard_count,
            rl.per_shard_capacity,
            metrics.as_ref(),
        );
        let reset_password = request_limiter(
            Action::ResetPassword,
            rl.reset_password_interval_secs,
            rl.reset_password_burst,
            rl.shard_count,
            rl.per_shard_capacity,
            metrics.as_ref(),
        );

        let email = match ShardedEmailRateLimiter::with_capacity(
            Duration::from_secs(rl.email_interval_secs),
            rl.shard_count,
            rl.per_shard_capacity,
        ) {
            Ok(limiter) => limiter,
            Err(e) => {
                error!(error = %e, "Failed to create email rate limiter, using defaults");
                ShardedEmailRateLimiter::with_capacity(
                    DEFAULT_EMAIL_INTERVAL,
                    DEFAULT_SHARD_COUNT,
                    DEFAULT_MAX_ENTRIES_PER_SHARD,
                )?
            }
        };
        let email = match metrics.clone() {
            Some(m) => email.with_metrics(m),
            None => email,
        };

        let users = match UserCache::new(config.user_cache.max_size, config.user_cache.ttl()) {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "Failed to create user cache, using defaults");
                UserCache::new(DEFAULT_MAX_SIZE, DEFAULT_TTL)?
            }
        };
        let users = Arc::new(match metrics.clone() {
            Some(m) => users.with_metrics(m),
            None => users,
        });

        let ban = match BanCheck::new(users.clone(), config.ban_check.timeout()) {
            Ok(ban) => ban,
            Err(e) => {
                error!(error = %e, "Invalid ban check timeout, using default");
                BanCheck::new(users.clone(), DEFAULT_BAN_CHECK_TIMEOUT)?
            }
        };
        let ban = match metrics.clone() {
            Some(m) => ban.with_metrics(m),
            None => ban,
        };

        let states = match StateStore::spawn(
            config.state_store.ttl(),
            config.state_store.sweep_interval(),
            metrics.clone(),
        ) {
            Ok(states) => states,
            Err(e) => {
                error!(error = %e, "Failed to create state store, using defaults");
                StateStore::spawn(DEFAULT_STATE_TTL, DEFAULT_SWEEP_INTERVAL, metrics.clone())?
            }
        };

        Ok(Self {
            login,
            register,
            reset_password,
            email,
            users,
            ban,
            states,
            metrics,
        })
    }

    /// Request limiter for `action`.
    #[must_use]
    pub fn limiter(&self, action: Action) -> &ShardedRateLimiter {
        match action {
            Action::Login => &self.login,
            Action::Register => &self.register,
            Action::ResetPassword => &self.reset_password,
        }
    }

    /// Whether a request for `action` from `key` may proceed.
    pub async fn allow(&self, action: Action, key: &str) -> bool {
        self.limiter(action).allow(key).await
    }

    /// Email cooldown limiter.
    #[must_use]
    pub fn email(&self) -> &ShardedEmailRateLimiter {
        &self.email
    }

    /// Shared user cache.
    #[must_use]
    pub fn users(&self) -> &Arc<UserCache<UserProfile>> {
        &self.users
    }

    /// OAuth state store.
    #[must_use]
    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    /// Runs a ban check for `user_id`, loading it with `loader` on a miss.
    pub async fn check_ban<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        loader: F,
    ) -> BanDecision
    where
        F: FnOnce(CancellationToken, i64) -> Fut,
        Fut: Future<Output = std::result::Result<Option<UserProfile>, E>>,
        E: std::fmt::Display,
    {
        self.ban.check(cancel, user_id, loader).await
    }

    /// Drops expired cached users and refreshes the size gauges.
    pub async fn maintain(&self) {
        let expired = self.users.evict_expired().await;
        if expired > 0 {
            debug!(expired, "Removed expired user cache entries");
        }

        if let Some(ref m) = self.metrics {
            for limiter in [&self.login, &self.register, &self.reset_password] {
                m.set_rate_limit_entries(limiter.name(), limiter.stats().await);
            }
            m.set_rate_limit_entries("email", self.email.stats().await);
        }
    }

    /// Runs [`maintain`](Self::maintain) every `every` until `shutdown` fires.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let guard = Arc::clone(self);
        tokio::spawn(async move {
            // `interval` panics on a zero period.
            let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => guard.maintain().await,
                }
            }
        })
    }

    pub async fn stats(&self) -> GuardStats {
        GuardStats {
            login_entries: self.login.stats().await,
            register_entries: self.register.stats().await,
            reset_password_entries: self.reset_password.stats().await,
            email_entries: self.email.stats().await,
            user_cache: self.users.stats().await,
            oauth_states: self.states.state_count().await,
            pending_links: self.states.pending_link_count().await,
        }
    }

    /// Stops background work owned by the guard.
    pub async fn close(&self) {
        self.states.close().await;
        info!("Guard closed");
    }
}

fn request_limiter(
    action: Action,
    interval_secs: u64,
    burst: u32,
    shard_count: usize,
    per_shard_capacity: usize,
    metrics: Option<&Metrics>,
) -> ShardedRateLimiter {
    let rate = Rate::every(Duration::from_secs(interval_secs));
    let limiter = match ShardedRateLimiter::with_shards(
        action.as_str(),
        rate,
        burst,
        shard_count,
        per_shard_capacity,
    ) {
        Ok(limiter) => limiter,
        Err(e) => {
            error!(limiter = action.as_str(), error = %e, "Failed to create rate limiter");
            ShardedRateLimiter::pass_through(action.as_str())
        }
    };

    match metrics {
        Some(m) => limiter.with_metrics(m.clone()),
        None => limiter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[tokio::test]
    async fn test_build_from_defaults() {
        let guard = Guard::build(&AppConfig::default(), None).unwrap();

        for action in [Action::Login, Action::Register, Action::ResetPassword] {
            assert!(!guard.limiter(action).is_pass_through());
            assert_eq!(guard.limiter(action).name(), action.as_str());
        }
        assert_eq!(guard.email().interval(), Duration::from_secs(60));
        assert_eq!(guard.users().max_size(), 1000);
        assert_eq!(guard.states().ttl(), Duration::from_secs(600));

        guard.close().await;
    }

    #[tokio::test]
    async fn test_invalid_limiter_falls_back_to_pass_through() {
        let mut config = AppConfig::default();
        config.rate_limit.login_burst = 0;
        config.rate_limit.email_interval_secs = 0;

        let guard = Guard::build(&config, None).unwrap();
        assert!(guard.limiter(Action::Login).is_pass_through());
        assert!(!guard.limiter(Action::Register).is_pass_through());
        for _ in 0..100 {
            assert!(guard.allow(Action::Login, "198.51.100.1").await);
        }
        assert_eq!(guard.email().interval(), DEFAULT_EMAIL_INTERVAL);

        guard.close().await;
    }

    #[tokio::test]
    async fn test_invalid_cache_and_store_fall_back_to_defaults() {
        let mut config = AppConfig::default();
        config.user_cache.max_size = 0;
        config.state_store.ttl_secs = 0;
        config.ban_check.timeout_ms = 0;

        let guard = Guard::build(&config, None).unwrap();
        assert_eq!(guard.users().max_size(), DEFAULT_MAX_SIZE);
        assert_eq!(guard.users().ttl(), DEFAULT_TTL);
        assert_eq!(guard.states().ttl(), DEFAULT_STATE_TTL);
        assert_eq!(guard.ban.timeout(), DEFAULT_BAN_CHECK_TIMEOUT);

        guard.close().await;
    }

    #[tokio::test]
    async fn test_login_limit_via_guard() {
        tokio::time::pause();
        let guard = Guard::build(&AppConfig::default(), None).unwrap();

        for _ in 0..5 {
            assert!(guard.allow(Action::Login, "192.0.2.10").await);
        }
        assert!(!guard.allow(Action::Login, "192.0.2.10").await);
        assert!(guard.allow(Action::Register, "192.0.2.10").await);

        guard.close().await;
    }

    #[tokio::test]
    async fn test_check_ban_uses_shared_cache() {
        let guard = Guard::build(&AppConfig::default(), None).unwrap();
        let cancel = CancellationToken::new();

        let decision = guard
            .check_ban(&cancel, 9, |_, id| async move {
                Ok::<_, Infallible>(Some(UserProfile::new(id, "eve", "eve@example.com")))
            })
            .await;
        assert_eq!(decision, BanDecision::Allowed);
        assert!(guard.users().get(9).await.is_some());

        guard.close().await;
    }

    #[tokio::test]
    async fn test_stats_and_maintenance() {
        let metrics = Metrics::new().unwrap();
        let guard = Guard::build(&AppConfig::default(), Some(metrics.clone())).unwrap();

        guard.allow(Action::Login, "192.0.2.1").await;
        guard.allow(Action::Login, "192.0.2.2").await;
        guard.email().allow("a@example.com").await;
        guard
            .states()
            .save_state("tok", crate::state_store::OAuthState::login())
            .await;

        let stats = guard.stats().await;
        assert_eq!(stats.login_entries, 2);
        assert_eq!(stats.register_entries, 0);
        assert_eq!(stats.email_entries, 1);
        assert_eq!(stats.oauth_states, 1);

        guard.maintain().await;
        assert_eq!(
            metrics.rate_limit_entries.with_label_values(&["login"]).get(),
            2
        );
        assert_eq!(
            metrics.rate_limit_entries.with_label_values(&["email"]).get(),
            1
        );

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["loginEntries"], 2);
        assert_eq!(json["userCache"]["maxSize"], 1000);

        guard.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_task_stops_on_shutdown() {
        let guard = Arc::new(Guard::build(&AppConfig::default(), None).unwrap());
        let (tx, rx) = watch::channel(false);

        let handle = guard.spawn_maintenance(Duration::from_secs(60), rx);
        tokio::time::sleep(Duration::from_secs(120)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        guard.close().await;
    }
}
