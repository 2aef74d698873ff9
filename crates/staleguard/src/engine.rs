use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::error::CacheContents;
use crate::key::CacheKey;

/// The largest ttl a storage engine must accept.
///
/// Engines commonly hand the millisecond ttl to backends using 32-bit signed
/// integers, so anything above this is a write error rather than a silent
/// truncation.
pub const MAX_TTL: Duration = Duration::from_millis(i32::MAX as u64);

/// The unit persisted by a storage engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<T> {
    /// The cached item itself.
    pub item: T,
    /// When the item was stored.
    pub stored_at: SystemTime,
    /// The ttl the item was stored with.
    pub ttl: Duration,
}

impl<T> Envelope<T> {
    pub fn new(item: T, stored_at: SystemTime, ttl: Duration) -> Self {
        Self {
            item,
            stored_at,
            ttl,
        }
    }

    /// The entry's age relative to `now`, zero for future timestamps.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.stored_at).unwrap_or_default()
    }
}

/// The contract a key-value backend exposes to the policy layer.
///
/// The policy never inspects storage internals; expiry bookkeeping and space
/// management are entirely the engine's business. Engines are treated as
/// external, possibly remote resources: no policy-level lock is ever held
/// across these calls.
#[async_trait]
pub trait Engine<T>: Send + Sync {
    /// Brings the engine into a ready state (connects, allocates, ...).
    async fn start(&self) -> CacheContents;

    /// Tears the engine down. A stopped engine answers
    /// [`CacheError::Disconnected`](crate::CacheError::Disconnected) until
    /// started again.
    async fn stop(&self);

    /// Whether the engine can currently serve requests.
    fn is_ready(&self) -> bool;

    /// Checks a segment name against the engine's naming rules.
    ///
    /// At minimum, empty names and names containing a NUL byte are rejected;
    /// [`validate_segment_name`](crate::validate_segment_name) implements
    /// that baseline.
    fn validate_segment_name(&self, name: &str) -> CacheContents;

    /// Reads the envelope stored under `key`, `None` on a miss.
    async fn get(&self, key: &CacheKey) -> CacheContents<Option<Envelope<T>>>;

    /// Persists `item` under `key` for `ttl`.
    ///
    /// A zero ttl means the item is not cacheable and is silently skipped;
    /// a ttl beyond [`MAX_TTL`] is a write error.
    async fn set(&self, key: &CacheKey, item: T, ttl: Duration) -> CacheContents;

    /// Removes the entry under `key`, regardless of whether it would be
    /// cacheable under current rules. Missing entries are not an error.
    async fn remove(&self, key: &CacheKey) -> CacheContents;
}
