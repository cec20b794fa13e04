//! Configuration loading and management.
//!
//! Supports TOML configuration files with environment variable overrides.
//! Environment variables follow the pattern: `GATEKEEPER_<SECTION>__<KEY>`,
//! for example `GATEKEEPER_RATE_LIMIT__LOGIN_BURST`.

use std::path::Path;
use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::error::Result;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration.
    pub server: ServerConfig,

    /// Rate limiter configuration.
    pub rate_limit: RateLimitConfig,

    /// User cache configuration.
    pub user_cache: UserCacheConfig,

    /// OAuth state store configuration.
    pub state_store: StateStoreConfig,

    /// Ban check configuration.
    pub ban_check: BanCheckConfig,

    /// Health check server configuration.
    pub health: HealthConfig,

    /// Metrics configuration.
    pub metrics: MetricsConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_shutdown_timeout() -> u64 {
    10
}

/// Rate limiter configuration.
///
/// Intervals are the time to earn one token; bursts are bucket capacities.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_login_interval")]
    pub login_interval_secs: u64,
    #[serde(default = "default_login_burst")]
    pub login_burst: u32,

    #[serde(default = "default_register_interval")]
    pub register_interval_secs: u64,
    #[serde(default = "default_register_burst")]
    pub register_burst: u32,

    #[serde(default = "default_register_interval")]
    pub reset_password_interval_secs: u64,
    #[serde(default = "default_register_burst")]
    pub reset_password_burst: u32,

    /// Number of shards per limiter; must be a power of two.
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Maximum tracked keys per shard.
    #[serde(default = "default_per_shard_capacity")]
    pub per_shard_capacity: usize,

    /// Minimum seconds between two emails to the same address.
    #[serde(default = "default_email_interval")]
    pub email_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login_interval_secs: default_login_interval(),
            login_burst: default_login_burst(),
            register_interval_secs: default_register_interval(),
            register_burst: default_register_burst(),
            reset_password_interval_secs: default_register_interval(),
            reset_password_burst: default_register_burst(),
            shard_count: default_shard_count(),
            per_shard_capacity: default_per_shard_capacity(),
            email_interval_secs: default_email_interval(),
        }
    }
}

fn default_login_interval() -> u64 {
    12
}

fn default_login_burst() -> u32 {
    5
}

fn default_register_interval() -> u64 {
    20
}

fn default_register_burst() -> u32 {
    3
}

fn default_shard_count() -> usize {
    crate::shard::DEFAULT_SHARD_COUNT
}

fn default_per_shard_capacity() -> usize {
    crate::rate_limiter::DEFAULT_MAX_ENTRIES_PER_SHARD
}

fn default_email_interval() -> u64 {
    60
}

/// User cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UserCacheConfig {
    /// Maximum number of cached users.
    #[serde(default = "default_user_cache_max_size")]
    pub max_size: usize,

    /// Seconds a cached user stays valid.
    #[serde(default = "default_user_cache_ttl")]
    pub ttl_secs: u64,

    /// Seconds between expired-entry cleanup passes.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for UserCacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_user_cache_max_size(),
            ttl_secs: default_user_cache_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_user_cache_max_size() -> usize {
    1000
}

fn default_user_cache_ttl() -> u64 {
    15 * 60
}

fn default_cleanup_interval() -> u64 {
    60
}

/// OAuth state store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StateStoreConfig {
    /// Seconds before a state or pending link expires.
    #[serde(default = "default_state_ttl")]
    pub ttl_secs: u64,

    /// Seconds between sweeps of expired entries.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_state_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_state_ttl() -> u64 {
    10 * 60
}

fn default_sweep_interval() -> u64 {
    5 * 60
}

/// Ban check configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BanCheckConfig {
    /// Deadline for resolving a user, in milliseconds.
    #[serde(default = "default_ban_timeout")]
    pub timeout_ms: u64,
}

impl Default for BanCheckConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_ban_timeout(),
        }
    }
}

fn default_ban_timeout() -> u64 {
    5000
}

/// Health check server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Whether the health check server is enabled.
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,

    /// Bind address for the health check server.
    #[serde(default = "default_health_bind_address")]
    pub bind_address: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            bind_address: default_health_bind_address(),
        }
    }
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error", "off".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "pretty".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl AppConfig {
    /// Load configuration from a file path with environment variable overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::defaults()?
            .add_source(File::from(path.as_ref()))
            .add_source(Self::environment())
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from environment variables only (no config file).
    pub fn from_env() -> Result<Self> {
        let config = Self::defaults()?.add_source(Self::environment()).build()?;

        Ok(config.try_deserialize()?)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let defaults = Self::default();
        let rl = &defaults.rate_limit;

        Ok(Config::builder()
            .set_default(
                "server.shutdown_timeout_secs",
                defaults.server.shutdown_timeout_secs,
            )?
            .set_default("rate_limit.login_interval_secs", rl.login_interval_secs)?
            .set_default("rate_limit.login_burst", u64::from(rl.login_burst))?
            .set_default("rate_limit.register_interval_secs", rl.register_interval_secs)?
            .set_default("rate_limit.register_burst", u64::from(rl.register_burst))?
            .set_default(
                "rate_limit.reset_password_interval_secs",
                rl.reset_password_interval_secs,
            )?
            .set_default("rate_limit.reset_password_burst", u64::from(rl.reset_password_burst))?
            .set_default("rate_limit.shard_count", rl.shard_count as u64)?
            .set_default("rate_limit.per_shard_capacity", rl.per_shard_capacity as u64)?
            .set_default("rate_limit.email_interval_secs", rl.email_interval_secs)?
            .set_default("user_cache.max_size", defaults.user_cache.max_size as u64)?
            .set_default("user_cache.ttl_secs", defaults.user_cache.ttl_secs)?
            .set_default(
                "user_cache.cleanup_interval_secs",
                defaults.user_cache.cleanup_interval_secs,
            )?
            .set_default("state_store.ttl_secs", defaults.state_store.ttl_secs)?
            .set_default(
                "state_store.sweep_interval_secs",
                defaults.state_store.sweep_interval_secs,
            )?
            .set_default("ban_check.timeout_ms", defaults.ban_check.timeout_ms)?
            .set_default("health.enabled", defaults.health.enabled)?
            .set_default("health.bind_address", defaults.health.bind_address)?
            .set_default("metrics.enabled", defaults.metrics.enabled)?
            .set_default("logging.level", defaults.logging.level)?
            .set_default("logging.format", defaults.logging.format)?)
    }

    fn environment() -> Environment {
        Environment::with_prefix("GATEKEEPER")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }
}

impl UserCacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl StateStoreConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl BanCheckConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
