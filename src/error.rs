//! Error types for Gatekeeper.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading or parsing error.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A component was constructed with invalid parameters.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// User cache error.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Metrics registration error.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the user cache.
///
/// `Clone` so that a single load result can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// User IDs must be positive.
    #[error("Invalid user ID: {0}")]
    InvalidUserId(i64),

    /// The loader succeeded but returned no profile.
    #[error("Loader returned no profile for user {0}")]
    MissingProfile(i64),

    /// The loader returned an error.
    #[error("Loader failed: {0}")]
    LoaderFailed(String),

    /// The caller's cancellation token fired before a result was available.
    #[error("Load cancelled")]
    Cancelled,
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
