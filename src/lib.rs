//! Gatekeeper - in-process guards for an authentication backend.
//!
//! Sharded per-client rate limiting, a per-address email cooldown, a user
//! profile cache that collapses concurrent loads, and a short-lived store
//! for OAuth state tokens and pending account links.

pub mod ban;
pub mod cache;
pub mod config;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod profile;
pub mod rate_limiter;
pub mod server;
pub mod shard;
pub mod shutdown;
pub mod state_store;

pub use ban::{BanCheck, BanDecision};
pub use cache::{BoundedTtlCache, CacheStats, UserCache};
pub use error::{CacheError, Error, Result};
pub use guard::{Action, Guard};
pub use profile::{Bannable, UserProfile};
pub use rate_limiter::{Rate, RateLimitPreset, ShardedEmailRateLimiter, ShardedRateLimiter};
pub use shard::ShardRouter;
pub use state_store::{OAuthAction, OAuthState, PendingLink, StateStore};
