//! Key-to-shard routing shared by the sharded limiters.

use std::sync::LazyLock;

use ahash::RandomState;

use crate::error::{Error, Result};

/// Default number of shards (must be a power of two).
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// Process-wide hash seed, so a key lands on the same shard for every
/// limiter built during this process.
static HASH_STATE: LazyLock<RandomState> = LazyLock::new(RandomState::new);

/// Maps string keys onto a fixed number of shards.
#[derive(Debug, Clone, Copy)]
pub struct ShardRouter {
    mask: u64,
}

impl ShardRouter {
    /// Creates a router for `shard_count` shards.
    ///
    /// `shard_count` must be a non-zero power of two.
    pub fn new(shard_count: usize) -> Result<Self> {
        if shard_count == 0 || !shard_count.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "shard count must be a non-zero power of two, got {shard_count}"
            )));
        }
        Ok(Self {
            mask: shard_count as u64 - 1,
        })
    }

    /// Number of shards this router distributes over.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        (self.mask + 1) as usize
    }

    /// Returns the shard index for `key`.
    ///
    /// The empty key always maps to shard 0.
    #[inline]
    #[must_use]
    pub fn shard_of(&self, key: &str) -> usize {
        if key.is_empty() {
            return 0;
        }
        (HASH_STATE.hash_one(key) & self.mask) as usize
    }
}

impl Default for ShardRouter {
    fn default() -> Self {
        Self {
            mask: DEFAULT_SHARD_COUNT as u64 - 1,
        }
    }
}
