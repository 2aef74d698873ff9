//! In-memory storage engine for staleguard, built on [`moka`].
//!
//! Entries expire on the ttl their envelope was stored with; eviction and
//! space management are moka's business. The engine follows the usual
//! lifecycle: it answers [`CacheError::Disconnected`] until started, and
//! stopping it discards all entries.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use moka::Expiry;
use moka::sync::Cache;

use staleguard::{
    CacheContents, CacheError, CacheKey, Engine, Envelope, MAX_TTL, validate_segment_name,
};

/// Expires every entry on the ttl carried in its envelope.
struct EnvelopeExpiration;

impl<T> Expiry<CacheKey, Envelope<T>> for EnvelopeExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &Envelope<T>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &Envelope<T>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// A process-local [`Engine`] over a [`moka::sync::Cache`].
pub struct MemoryEngine<T> {
    cache: Cache<CacheKey, Envelope<T>>,
    ready: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> MemoryEngine<T> {
    /// Creates an engine without a capacity bound.
    ///
    /// The engine starts out stopped; call [`Engine::start`] before use.
    pub fn new() -> Self {
        let cache = Cache::builder().expire_after(EnvelopeExpiration).build();
        Self {
            cache,
            ready: AtomicBool::new(false),
        }
    }

    /// Creates an engine holding at most `capacity` entries, evicting by
    /// frequency and recency beyond that.
    pub fn with_capacity(capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .expire_after(EnvelopeExpiration)
            .build();
        Self {
            cache,
            ready: AtomicBool::new(false),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for MemoryEngine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MemoryEngine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("ready", &self.ready.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Engine<T> for MemoryEngine<T> {
    async fn start(&self) -> CacheContents {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.cache.invalidate_all();
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn validate_segment_name(&self, name: &str) -> CacheContents {
        validate_segment_name(name)
    }

    async fn get(&self, key: &CacheKey) -> CacheContents<Option<Envelope<T>>> {
        if !self.is_ready() {
            return Err(CacheError::Disconnected);
        }
        Ok(self.cache.get(key))
    }

    async fn set(&self, key: &CacheKey, item: T, ttl: Duration) -> CacheContents {
        if !self.is_ready() {
            return Err(CacheError::Disconnected);
        }
        if ttl.is_zero() {
            tracing::trace!(key = %key, "skipping write of non-cacheable item");
            return Ok(());
        }
        if ttl > MAX_TTL {
            return Err(CacheError::Write(format!(
                "ttl of {}ms exceeds the engine maximum",
                ttl.as_millis()
            )));
        }

        let envelope = Envelope::new(item, SystemTime::now(), ttl);
        self.cache.insert(key.clone(), envelope);
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> CacheContents {
        if !self.is_ready() {
            return Err(CacheError::Disconnected);
        }
        self.cache.invalidate(key);
        Ok(())
    }
}
