use std::time::Duration;

use thiserror::Error;

/// An error that happens while reading, writing or generating a cache item.
///
/// Most variants carry an opaque message describing what the storage engine or
/// the generator reported. The variants are `Clone` because a single failed
/// generation attempt is broadcast to every caller that joined it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The item does not exist in the cache and no generator is attached.
    #[error("not found")]
    NotFound,
    /// The storage engine is not started or lost its connection.
    #[error("cache engine is not ready")]
    Disconnected,
    /// The id or segment does not form a usable storage key.
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),
    /// The storage engine failed to read an item.
    #[error("cache read failed: {0}")]
    Read(String),
    /// The caller-supplied generator failed to produce a value.
    #[error("generation failed: {0}")]
    Generate(String),
    /// The storage engine failed to persist a freshly generated value.
    #[error("cache write failed: {0}")]
    Write(String),
    /// A caller's local wait for an in-flight generation elapsed.
    ///
    /// This only affects the timed-out caller; the generation itself keeps
    /// running and its result is still written to storage.
    #[error("timed out waiting for generation after {0:?}")]
    Timeout(Duration),
    /// An unexpected error in staleguard itself.
    #[error("internal error")]
    InternalError,
}

/// The contents of a cache operation, either `Ok(T)` or a [`CacheError`].
pub type CacheContents<T = ()> = Result<T, CacheError>;

/// A rule configuration that cannot be compiled.
///
/// These are fatal and surface at policy construction time, never at call
/// time. Each variant names the violated constraint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("one of `expires_in` and `expires_at` must be set")]
    MissingExpiry,
    #[error("`expires_in` and `expires_at` are mutually exclusive")]
    AmbiguousExpiry,
    #[error("invalid time string")]
    InvalidTimeString,
    #[error("`stale_in` and `stale_timeout` must be set together")]
    IncompleteStaleRule,
    #[error("`stale_in` requires a generator")]
    StaleRequiresGenerator,
    #[error("`stale_in` must be smaller than `expires_in`")]
    StaleInTooLarge,
    #[error("`stale_timeout` must be smaller than `expires_in` minus `stale_in`")]
    StaleTimeoutTooLarge,
    #[error("`stale_in` must be below 24 hours when using `expires_at`")]
    StaleInBeyondDay,
    #[error("`pending_generate_timeout` must exceed `stale_timeout`")]
    PendingGenerateTimeoutTooSmall,
    #[error("a generator and `generate_timeout` must be attached together")]
    IncompleteGenerateRule,
    #[error("invalid segment name: {0}")]
    InvalidSegmentName(String),
}
