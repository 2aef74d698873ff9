use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;

use crate::engine::{Engine, Envelope};
use crate::error::{CacheContents, CacheError};
use crate::key::CacheKey;
use crate::pending::{PendingEntry, PendingRegistry};
use crate::policy::{CachedInfo, Detailed, Policy};
use crate::rule::Rule;

/// A freshly generated value, with an optional per-item ttl override.
#[derive(Debug, Clone)]
pub struct Generated<T> {
    pub value: T,
    /// Overrides the rule-computed ttl for this item, letting a generator
    /// mark individual results as shorter-lived (or, at zero, not cacheable).
    pub ttl: Option<Duration>,
}

impl<T> Generated<T> {
    pub fn new(value: T) -> Self {
        Self { value, ttl: None }
    }

    pub fn with_ttl(value: T, ttl: Duration) -> Self {
        Self {
            value,
            ttl: Some(ttl),
        }
    }
}

/// Produces values for cache misses and refreshes.
///
/// The future may suspend arbitrarily; the policy bounds how long *callers*
/// wait on it, never how long it runs. A generation error is broadcast to
/// every caller that joined the attempt.
pub trait Generator: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;

    fn generate<'a>(&'a self, id: &'a str) -> BoxFuture<'a, CacheContents<Generated<Self::Item>>>;
}

/// What one generation attempt delivers to its joiners.
#[derive(Debug, Clone)]
pub(crate) struct AttemptOutcome<T> {
    pub value: T,
    /// A write error the rule asked to surface alongside the value.
    pub write_error: Option<CacheError>,
}

/// The read-path classification of an entry.
#[derive(Debug)]
pub(crate) enum Classification<T> {
    /// No entry, or the entry is already expired.
    Miss,
    /// The entry's age is below the staleness threshold; the carried duration
    /// is the remaining ttl.
    Fresh(Envelope<T>, Duration),
    /// The entry is at or past the staleness threshold but not yet expired.
    Stale(Envelope<T>, Duration),
}

pub(crate) fn classify<T>(
    rule: &Rule,
    envelope: Option<Envelope<T>>,
    now: SystemTime,
) -> Classification<T> {
    let Some(envelope) = envelope else {
        return Classification::Miss;
    };

    let remaining = rule.ttl(envelope.stored_at, now);
    if remaining.is_zero() {
        return Classification::Miss;
    }

    let Some(stale) = rule.stale() else {
        return Classification::Fresh(envelope, remaining);
    };

    let threshold = stale.stale_in.threshold(envelope.stored_at, remaining);
    if envelope.age(now) < threshold {
        Classification::Fresh(envelope, remaining)
    } else {
        Classification::Stale(envelope, remaining)
    }
}

/// Delivers an error to an attempt's joiners if the owning task dies without
/// delivering a result, so a panicking generator cannot strand them.
struct DeliveryGuard<'a, R: Clone> {
    registry: &'a PendingRegistry<R>,
    key: &'a CacheKey,
    entry: &'a Arc<PendingEntry<R>>,
    delivered: bool,
}

impl<R: Clone> DeliveryGuard<'_, R> {
    fn deliver(mut self, result: CacheContents<R>) {
        self.delivered = true;
        self.registry.deliver(self.key, self.entry, result);
    }
}

impl<R: Clone> Drop for DeliveryGuard<'_, R> {
    fn drop(&mut self) {
        if !self.delivered {
            self.registry
                .deliver(self.key, self.entry, Err(CacheError::InternalError));
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Policy<T> {
    /// Returns the cached value if fresh, serves a stale value while
    /// refreshing it in the background, or generates on a miss.
    ///
    /// Concurrent callers for the same key share a single generation attempt;
    /// each waits with its own local bound (`generate_timeout` on a miss,
    /// `stale_timeout` when a stale entry is too close to hard expiry to be
    /// served). See [`Detailed`] for what the decorated result carries.
    pub async fn get_or_generate_detailed(&self, id: &str) -> CacheContents<Detailed<T>> {
        let rule = self.rule();
        let key = self.key(id)?;
        self.stats.record_get();

        let (envelope, read_error) = match self.read(&key).await {
            Ok(envelope) => (envelope, None),
            Err(err) => {
                if self.generator.is_none() || !rule.generate_on_read_error() {
                    self.stats.record_error();
                    return Err(err);
                }
                tracing::warn!(key = %key, error = %err, "cache read failed, generating instead");
                (None, Some(err))
            }
        };

        let now = SystemTime::now();
        match classify(&rule, envelope, now) {
            Classification::Fresh(envelope, ttl) => {
                self.stats.record_hit();
                Ok(Detailed {
                    value: envelope.item,
                    cached: Some(CachedInfo {
                        stored_at: envelope.stored_at,
                        ttl,
                        is_stale: false,
                    }),
                    report: read_error,
                })
            }
            Classification::Miss => {
                let Some(timeout) = rule.generate_timeout() else {
                    // No generator attached, this is a plain cached read.
                    return Err(CacheError::NotFound);
                };
                self.wait_for_generation(&key, &rule, timeout.bound(), read_error)
                    .await
            }
            Classification::Stale(envelope, ttl) => {
                self.stats.record_hit();
                self.stats.record_stale();

                let Some(stale) = rule.stale() else {
                    return Err(CacheError::InternalError);
                };
                if ttl < stale.stale_timeout {
                    // Not enough slack left to serve the stale value and
                    // refresh later: callers could observe a fully expired
                    // item before the refresh lands. Wait synchronously,
                    // bounded by the stale timeout.
                    self.wait_for_generation(&key, &rule, Some(stale.stale_timeout), read_error)
                        .await
                } else {
                    self.spawn_refresh(&key, &rule);
                    Ok(Detailed {
                        value: envelope.item,
                        cached: Some(CachedInfo {
                            stored_at: envelope.stored_at,
                            ttl,
                            is_stale: true,
                        }),
                        report: read_error,
                    })
                }
            }
        }
    }

    /// Joins (or starts) the coalesced generation for `key` and waits for its
    /// result, bounded by `bound`.
    async fn wait_for_generation(
        &self,
        key: &CacheKey,
        rule: &Arc<Rule>,
        bound: Option<Duration>,
        read_error: Option<CacheError>,
    ) -> CacheContents<Detailed<T>> {
        let (join, is_starter) = self.pending.acquire(key);
        if is_starter {
            self.spawn_attempt(key.clone(), Arc::clone(rule), Arc::clone(join.entry()));
        }

        match join.outcome(bound).await {
            Ok(outcome) => Ok(Detailed {
                value: outcome.value,
                cached: None,
                report: outcome.write_error.or(read_error),
            }),
            Err(err) => {
                // Attempt failures are counted once by the attempt itself;
                // only this caller's local timeout is counted here.
                if matches!(err, CacheError::Timeout(_)) {
                    self.stats.record_error();
                }
                Err(err)
            }
        }
    }

    /// Kicks off a background refresh for a stale entry.
    ///
    /// With `pending_generate_timeout` set, an in-flight attempt younger than
    /// that is joined instead of starting new work. Without it, every stale
    /// hit triggers its own refresh attempt.
    fn spawn_refresh(&self, key: &CacheKey, rule: &Arc<Rule>) {
        let Some(entry) = self
            .pending
            .begin_refresh(key, rule.pending_generate_timeout())
        else {
            tracing::trace!(key = %key, "refresh already in flight, joining");
            return;
        };

        tracing::trace!(key = %key, "spawning background refresh");
        self.spawn_attempt(key.clone(), Arc::clone(rule), entry);
    }

    fn spawn_attempt(
        &self,
        key: CacheKey,
        rule: Arc<Rule>,
        entry: Arc<PendingEntry<AttemptOutcome<T>>>,
    ) {
        let policy = self.clone();
        tokio::spawn(async move {
            policy.run_attempt(key, rule, entry).await;
        });
    }

    /// Runs one generation attempt and delivers its result to all joiners.
    ///
    /// Timing out callers does not reach this task: the attempt always runs
    /// to completion and a successful result is still written to storage.
    async fn run_attempt(
        &self,
        key: CacheKey,
        rule: Arc<Rule>,
        entry: Arc<PendingEntry<AttemptOutcome<T>>>,
    ) {
        let guard = DeliveryGuard {
            registry: &self.pending,
            key: &key,
            entry: &entry,
            delivered: false,
        };

        let Some(generator) = self.generator.clone() else {
            guard.deliver(Err(CacheError::InternalError));
            return;
        };
        self.stats.record_generate();

        let result = match generator.generate(key.id()).await {
            Ok(generated) => {
                let write_error = self.store_generated(&key, &rule, &generated).await;
                Ok(AttemptOutcome {
                    value: generated.value,
                    write_error,
                })
            }
            Err(err) => {
                self.stats.record_error();
                if rule.drop_on_error() {
                    if let Some(engine) = &self.engine {
                        if let Err(drop_err) = engine.remove(&key).await {
                            tracing::debug!(
                                key = %key,
                                error = %drop_err,
                                "failed to drop entry after generation error"
                            );
                        }
                    }
                }
                Err(err)
            }
        };

        guard.deliver(result);
    }

    /// Persists a generated value, honoring the ttl override.
    ///
    /// Returns the write error to surface alongside the value, or `None` when
    /// the write succeeded, was skipped, or the rule ignores write errors.
    async fn store_generated(
        &self,
        key: &CacheKey,
        rule: &Rule,
        generated: &Generated<T>,
    ) -> Option<CacheError> {
        let Some(engine) = &self.engine else {
            return None;
        };
        self.stats.record_set();

        let now = SystemTime::now();
        let ttl = generated.ttl.unwrap_or_else(|| rule.ttl(now, now));
        let result = if engine.is_ready() {
            engine.set(key, generated.value.clone(), ttl).await
        } else {
            Err(CacheError::Disconnected)
        };

        match result {
            Ok(()) => None,
            Err(err) if rule.generate_ignore_write_error() => {
                tracing::warn!(key = %key, error = %err, "ignoring cache write failure after generation");
                None
            }
            Err(err) => {
                self.stats.record_error();
                // Surface every write-phase failure uniformly, so callers can
                // tell it apart from the generation having failed.
                Some(match err {
                    err @ CacheError::Write(_) => err,
                    other => CacheError::Write(other.to_string()),
                })
            }
        }
    }
}
