use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::{CacheContents, CacheError};
use crate::key::CacheKey;

/// One in-flight generation attempt.
///
/// The entry owns the broadcast sender; every joiner holds a receiver that was
/// subscribed while the registry lock was held, so a delivery can never race
/// past a joiner that acquired before it.
pub(crate) struct PendingEntry<R> {
    started_at: Instant,
    joiners: AtomicUsize,
    tx: broadcast::Sender<CacheContents<R>>,
}

impl<R: Clone> PendingEntry<R> {
    fn new() -> (Arc<Self>, broadcast::Receiver<CacheContents<R>>) {
        // A single result is ever sent, so capacity 1 cannot lag.
        let (tx, rx) = broadcast::channel(1);
        let entry = Arc::new(PendingEntry {
            started_at: Instant::now(),
            joiners: AtomicUsize::new(1),
            tx,
        });
        (entry, rx)
    }

    /// How long ago this attempt was started.
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// The number of callers that have joined this attempt so far.
    pub fn joiners(&self) -> usize {
        self.joiners.load(Ordering::Relaxed)
    }
}

/// A caller's handle on an in-flight generation attempt.
pub(crate) struct PendingJoin<R> {
    entry: Arc<PendingEntry<R>>,
    rx: broadcast::Receiver<CacheContents<R>>,
}

impl<R: Clone> PendingJoin<R> {
    pub fn entry(&self) -> &Arc<PendingEntry<R>> {
        &self.entry
    }

    /// Waits for the attempt's result, bounded by `timeout`.
    ///
    /// `None` waits until delivery, however long that takes. The timeout is
    /// local to this joiner: elapsing it neither cancels the generation nor
    /// affects other joiners, and the entry stays registered so late arrivals
    /// still join the same attempt.
    pub async fn outcome(mut self, timeout: Option<Duration>) -> CacheContents<R> {
        let recv = async move {
            match self.rx.recv().await {
                Ok(result) => result,
                // The owning task went away without delivering. `deliver` runs
                // on all regular paths, so this is a bug or a panicked task.
                Err(_) => Err(CacheError::InternalError),
            }
        };

        match timeout {
            Some(bound) => match tokio::time::timeout(bound, recv).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::Timeout(bound)),
            },
            None => recv.await,
        }
    }
}

/// The per-key arena of in-flight generation attempts.
///
/// `acquire` is the linearization point for the at-most-one-active-generation
/// guarantee: lookup, registration and receiver subscription all happen under
/// one lock, so two callers racing on the same key cannot both become the
/// starter. The lock is never held across an await.
pub(crate) struct PendingRegistry<R> {
    entries: Mutex<FxHashMap<CacheKey, Arc<PendingEntry<R>>>>,
}

impl<R: Clone> PendingRegistry<R> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Joins the in-flight attempt for `key`, or registers a new one.
    ///
    /// Returns `true` when the caller became the starter and is responsible
    /// for running the generation and delivering its result.
    pub fn acquire(&self, key: &CacheKey) -> (PendingJoin<R>, bool) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(key) {
            entry.joiners.fetch_add(1, Ordering::Relaxed);
            let join = PendingJoin {
                rx: entry.tx.subscribe(),
                entry: Arc::clone(entry),
            };
            (join, false)
        } else {
            let (entry, rx) = PendingEntry::new();
            entries.insert(key.clone(), Arc::clone(&entry));
            (PendingJoin { entry, rx }, true)
        }
    }

    /// Registers a background refresh attempt for `key`.
    ///
    /// With `reuse_within` set, an in-flight attempt younger than that bound
    /// is joined instead and `None` is returned: the caller has nothing to
    /// run. Otherwise a fresh attempt is registered, replacing whatever
    /// occupied the slot; joiners of a replaced attempt keep their
    /// subscription and still receive that attempt's own result.
    pub fn begin_refresh(
        &self,
        key: &CacheKey,
        reuse_within: Option<Duration>,
    ) -> Option<Arc<PendingEntry<R>>> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(key) {
            if reuse_within.is_some_and(|bound| entry.age() < bound) {
                return None;
            }
        }

        let (entry, _rx) = PendingEntry::new();
        entries.insert(key.clone(), Arc::clone(&entry));
        Some(entry)
    }

    /// Delivers an attempt's result to all of its joiners.
    ///
    /// The entry is unregistered *before* the broadcast, so a caller arriving
    /// after delivery can never observe the finished attempt and always
    /// starts a fresh one. Only the entry that still owns the registry slot
    /// is removed; a replaced attempt delivering late must not evict its
    /// successor.
    pub fn deliver(&self, key: &CacheKey, entry: &Arc<PendingEntry<R>>, result: CacheContents<R>) {
        {
            let mut entries = self.entries.lock().unwrap();
            if entries.get(key).is_some_and(|e| Arc::ptr_eq(e, entry)) {
                entries.remove(key);
            }
        }

        tracing::trace!(key = %key, joiners = entry.joiners(), "delivering generation result");
        // A send error only means every joiner already timed out.
        let _ = entry.tx.send(result);
    }

    /// The number of generation attempts currently in flight.
    pub fn in_flight(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> CacheKey {
        CacheKey::new("test", id)
    }

    #[tokio::test]
    async fn test_acquire_coalesces() {
        let registry = PendingRegistry::<u32>::new();
        let key = key("a");

        let (starter, is_new) = registry.acquire(&key);
        assert!(is_new);
        let (joiner, is_new) = registry.acquire(&key);
        assert!(!is_new);
        assert_eq!(starter.entry().joiners(), 2);

        let entry = Arc::clone(starter.entry());
        registry.deliver(&key, &entry, Ok(7));

        assert_eq!(starter.outcome(None).await, Ok(7));
        assert_eq!(joiner.outcome(None).await, Ok(7));
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_late_joiner_starts_fresh() {
        let registry = PendingRegistry::<u32>::new();
        let key = key("a");

        let (starter, _) = registry.acquire(&key);
        let entry = Arc::clone(starter.entry());
        registry.deliver(&key, &entry, Ok(1));

        let (_join, is_new) = registry.acquire(&key);
        assert!(is_new);
    }

    #[tokio::test]
    async fn test_joiner_timeout_keeps_entry_registered() {
        let registry = PendingRegistry::<u32>::new();
        let key = key("a");

        let (starter, _) = registry.acquire(&key);
        let result = registry
            .acquire(&key)
            .0
            .outcome(Some(Duration::from_millis(10)))
            .await;
        assert_eq!(result, Err(CacheError::Timeout(Duration::from_millis(10))));

        // The attempt is still in flight; a later caller joins it.
        let (joiner, is_new) = registry.acquire(&key);
        assert!(!is_new);

        let entry = Arc::clone(starter.entry());
        registry.deliver(&key, &entry, Ok(3));
        assert_eq!(joiner.outcome(None).await, Ok(3));
    }

    #[tokio::test]
    async fn test_refresh_joins_young_attempt() {
        let registry = PendingRegistry::<u32>::new();
        let key = key("a");

        let (_starter, _) = registry.acquire(&key);
        assert!(
            registry
                .begin_refresh(&key, Some(Duration::from_secs(60)))
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_refresh_replaces_without_reuse_bound() {
        let registry = PendingRegistry::<u32>::new();
        let key = key("a");

        let (old_join, _) = registry.acquire(&key);
        let old_entry = Arc::clone(old_join.entry());

        let replacement = registry.begin_refresh(&key, None).unwrap();
        assert!(!Arc::ptr_eq(&old_entry, &replacement));

        // The replaced attempt delivers late: its joiners still get its
        // result, and the successor keeps the registry slot.
        registry.deliver(&key, &old_entry, Ok(1));
        assert_eq!(old_join.outcome(None).await, Ok(1));
        assert_eq!(registry.in_flight(), 1);

        registry.deliver(&key, &replacement, Ok(2));
        assert_eq!(registry.in_flight(), 0);
    }
}
