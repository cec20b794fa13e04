//! Bounded caches.

pub mod bounded;
pub mod user;

pub use bounded::BoundedTtlCache;
pub use user::{CacheStats, UserCache};
