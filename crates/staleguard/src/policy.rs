use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use crate::config::RuleConfig;
use crate::engine::{Engine, Envelope};
use crate::error::{CacheContents, CacheError, ConfigError};
use crate::generate::{AttemptOutcome, Classification, Generator, classify};
use crate::key::CacheKey;
use crate::pending::PendingRegistry;
use crate::rule::Rule;

/// Metadata about where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedInfo {
    /// When the entry was stored.
    pub stored_at: SystemTime,
    /// The entry's remaining time-to-live at read time.
    pub ttl: Duration,
    /// Whether the entry was past its staleness threshold.
    pub is_stale: bool,
}

/// A decorated result: the value plus cache provenance and an advisory error.
///
/// `cached` is `None` for values that came straight out of a generation
/// rather than storage. `report` carries errors that did not fail the call:
/// a read error superseded by a successful generation, or a write error the
/// rule asked to surface alongside the value. The plain
/// [`Policy::get_or_generate`] projection turns a reported write error into
/// the call's error and discards advisory read errors.
#[derive(Debug, Clone, PartialEq)]
pub struct Detailed<T> {
    pub value: T,
    pub cached: Option<CachedInfo>,
    pub report: Option<CacheError>,
}

/// Process-local operation counters of one [`Policy`].
///
/// Counters are monotonic and only reset by recreating the policy.
#[derive(Debug, Default)]
pub(crate) struct PolicyStats {
    sets: AtomicU64,
    gets: AtomicU64,
    hits: AtomicU64,
    stales: AtomicU64,
    generates: AtomicU64,
    errors: AtomicU64,
}

impl PolicyStats {
    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stales.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_generate(&self) {
        self.generates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sets: self.sets.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            stales: self.stales.load(Ordering::Relaxed),
            generates: self.generates.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of a policy's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    pub sets: u64,
    pub gets: u64,
    pub hits: u64,
    pub stales: u64,
    pub generates: u64,
    pub errors: u64,
}

/// Builder for a [`Policy`].
pub struct PolicyBuilder<T> {
    segment: String,
    config: RuleConfig,
    engine: Option<Arc<dyn Engine<T>>>,
    generator: Option<Arc<dyn Generator<Item = T>>>,
}

impl<T: Clone + Send + Sync + 'static> PolicyBuilder<T> {
    pub fn new(segment: impl Into<String>, config: RuleConfig) -> Self {
        Self {
            segment: segment.into(),
            config,
            engine: None,
            generator: None,
        }
    }

    /// Attaches a storage engine. Without one the policy never caches:
    /// `get`/`set`/`drop` are no-ops and `get_or_generate` always generates.
    pub fn engine(mut self, engine: Arc<dyn Engine<T>>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Attaches a generator. Requires `generate_timeout` in the rule config.
    pub fn generator(mut self, generator: Arc<dyn Generator<Item = T>>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Compiles the rule, validates the segment name and builds the policy.
    ///
    /// All configuration errors surface here, never at call time.
    pub fn build(self) -> Result<Policy<T>, ConfigError> {
        let rule = Rule::compile(&self.config, self.generator.is_some())?;

        let validation = match &self.engine {
            Some(engine) => engine.validate_segment_name(&self.segment),
            None => crate::key::validate_segment_name(&self.segment),
        };
        if validation.is_err() {
            return Err(ConfigError::InvalidSegmentName(self.segment));
        }

        Ok(Policy {
            segment: self.segment.into(),
            engine: self.engine,
            generator: self.generator,
            rule: Arc::new(RwLock::new(Arc::new(rule))),
            pending: Arc::new(PendingRegistry::new()),
            stats: Arc::new(PolicyStats::default()),
        })
    }
}

/// A per-segment cache policy.
///
/// The policy translates ids into storage keys within its segment, applies
/// the compiled [`Rule`] to decide fresh/stale/miss, and coordinates
/// generation through the pending registry so concurrent callers for the
/// same key share one attempt. Cloning is cheap; clones share the engine,
/// registry, rule and counters.
pub struct Policy<T> {
    pub(crate) segment: Arc<str>,
    pub(crate) engine: Option<Arc<dyn Engine<T>>>,
    pub(crate) generator: Option<Arc<dyn Generator<Item = T>>>,
    rule: Arc<RwLock<Arc<Rule>>>,
    pub(crate) pending: Arc<PendingRegistry<AttemptOutcome<T>>>,
    pub(crate) stats: Arc<PolicyStats>,
}

impl<T> Clone for Policy<T> {
    fn clone(&self) -> Self {
        Policy {
            segment: Arc::clone(&self.segment),
            engine: self.engine.clone(),
            generator: self.generator.clone(),
            rule: Arc::clone(&self.rule),
            pending: Arc::clone(&self.pending),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T: Clone> fmt::Debug for Policy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("segment", &self.segment)
            .field("in-flight generations", &self.pending.in_flight())
            .field("has_engine", &self.engine.is_some())
            .field("has_generator", &self.generator.is_some())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Policy<T> {
    pub fn builder(segment: impl Into<String>, config: RuleConfig) -> PolicyBuilder<T> {
        PolicyBuilder::new(segment, config)
    }

    /// The rule snapshot used for the remainder of one call.
    pub(crate) fn rule(&self) -> Arc<Rule> {
        self.rule.read().unwrap().clone()
    }

    /// Atomically replaces the policy's rule.
    ///
    /// In-flight operations keep working against the snapshot they loaded at
    /// entry; only calls starting after the swap see the new rule.
    pub fn replace_rule(&self, config: &RuleConfig) -> Result<(), ConfigError> {
        let rule = Rule::compile(config, self.generator.is_some())?;
        *self.rule.write().unwrap() = Arc::new(rule);
        Ok(())
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    /// Whether the backing engine can serve requests. A policy without an
    /// engine is a pure passthrough and always ready.
    pub fn is_ready(&self) -> bool {
        self.engine.as_ref().is_none_or(|engine| engine.is_ready())
    }

    /// The remaining time-to-live of an entry created at `created_at`.
    pub fn ttl(&self, created_at: SystemTime) -> Duration {
        self.rule().ttl(created_at, SystemTime::now())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn key(&self, id: &str) -> CacheContents<CacheKey> {
        if id.is_empty() {
            return Err(CacheError::InvalidKey("empty id"));
        }
        Ok(CacheKey::new(Arc::clone(&self.segment), id))
    }

    pub(crate) async fn read(&self, key: &CacheKey) -> CacheContents<Option<Envelope<T>>> {
        let Some(engine) = &self.engine else {
            return Ok(None);
        };
        if !engine.is_ready() {
            return Err(CacheError::Disconnected);
        }
        engine.get(key).await
    }

    /// Reads the entry under `id` without triggering generation.
    ///
    /// Stale entries are returned with `is_stale` set; expired entries read
    /// as `None`.
    pub async fn get(&self, id: &str) -> CacheContents<Option<Detailed<T>>> {
        let rule = self.rule();
        let key = self.key(id)?;
        self.stats.record_get();

        let envelope = match self.read(&key).await {
            Ok(envelope) => envelope,
            Err(err) => {
                self.stats.record_error();
                return Err(err);
            }
        };

        let now = SystemTime::now();
        Ok(match classify(&rule, envelope, now) {
            Classification::Miss => None,
            Classification::Fresh(envelope, ttl) => {
                self.stats.record_hit();
                Some(Detailed {
                    value: envelope.item,
                    cached: Some(CachedInfo {
                        stored_at: envelope.stored_at,
                        ttl,
                        is_stale: false,
                    }),
                    report: None,
                })
            }
            Classification::Stale(envelope, ttl) => {
                self.stats.record_hit();
                self.stats.record_stale();
                Some(Detailed {
                    value: envelope.item,
                    cached: Some(CachedInfo {
                        stored_at: envelope.stored_at,
                        ttl,
                        is_stale: true,
                    }),
                    report: None,
                })
            }
        })
    }

    /// Stores `item` under `id`, with the rule's ttl unless overridden.
    pub async fn set(&self, id: &str, item: T, ttl: Option<Duration>) -> CacheContents {
        let rule = self.rule();
        let key = self.key(id)?;
        self.stats.record_set();

        let Some(engine) = &self.engine else {
            return Ok(());
        };
        if !engine.is_ready() {
            self.stats.record_error();
            return Err(CacheError::Disconnected);
        }

        let now = SystemTime::now();
        let ttl = ttl.unwrap_or_else(|| rule.ttl(now, now));
        engine.set(&key, item, ttl).await.inspect_err(|_| {
            self.stats.record_error();
        })
    }

    /// Removes the entry under `id`. Missing entries are not an error.
    pub async fn drop(&self, id: &str) -> CacheContents {
        let key = self.key(id)?;

        let Some(engine) = &self.engine else {
            return Ok(());
        };
        if !engine.is_ready() {
            self.stats.record_error();
            return Err(CacheError::Disconnected);
        }
        engine.remove(&key).await.inspect_err(|_| {
            self.stats.record_error();
        })
    }

    /// Like [`Policy::get_or_generate_detailed`], projected down to the bare
    /// value: a reported write error becomes the call's error, an advisory
    /// read error superseded by a successful generation is discarded.
    pub async fn get_or_generate(&self, id: &str) -> CacheContents<T> {
        let detailed = self.get_or_generate_detailed(id).await?;
        match detailed.report {
            Some(err @ CacheError::Write(_)) => Err(err),
            _ => Ok(detailed.value),
        }
    }
}
