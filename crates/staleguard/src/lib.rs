//! # Staleguard caching policies
//!
//! Staleguard is a cache-aside orchestration layer. Given a key it returns a
//! cached value if fresh, serves a stale value while refreshing it in the
//! background, or generates a new value on a miss — while guaranteeing that
//! concurrent callers for the same key never trigger redundant concurrent
//! generation work.
//!
//! ## Layers
//!
//! A [`Policy`] wraps one *segment* (a named partition of keys sharing one
//! rule) over a pluggable storage [`Engine`]. A request goes through the
//! following steps:
//!
//! - The envelope under the key is read from the engine.
//! - The compiled [`Rule`] classifies it as fresh, stale, or a miss.
//! - Fresh entries are returned directly.
//! - Stale entries are returned immediately while a refresh runs on a
//!   background task — unless the entry is so close to hard expiry that
//!   callers could observe a fully expired item before the refresh lands, in
//!   which case the call degrades to a synchronous wait.
//! - Misses wait for a generation, coalesced across all concurrent callers of
//!   the same key: exactly one [`Generator`] invocation runs, and its result
//!   is broadcast to everyone who joined it.
//!
//! Waits are bounded per caller (`generate_timeout` on misses, `stale_timeout`
//! on degraded stale hits). The bounds are local: a timed-out caller gets a
//! [`CacheError::Timeout`] while the generation keeps running, and its result
//! is still written to storage for the next caller.
//!
//! ## Rules
//!
//! A [`RuleConfig`] describes expiry (relative `expires_in` or daily
//! wall-clock `expires_at`), the staleness window, wait bounds, and error
//! policies (`drop_on_error`, `generate_on_read_error`,
//! `generate_ignore_write_error`). It compiles into an immutable [`Rule`] at
//! policy construction; invalid combinations fail fast there, never at call
//! time. [`Policy::replace_rule`] swaps the rule atomically at runtime.
//!
//! ## Engines
//!
//! Storage is behind the [`Engine`] trait: `get`/`set`/`remove` on
//! [`Envelope`]s plus lifecycle and segment-name validation. The policy never
//! inspects storage internals, and expiry bookkeeping of the store itself
//! (eviction, space management) is entirely the engine's business. The
//! `staleguard-memory` crate provides the in-memory engine; a policy built
//! without any engine degrades to a pure generation passthrough, which is
//! useful for coalescing expensive work that should not be cached.

mod config;
mod engine;
mod error;
mod generate;
mod key;
mod pending;
mod policy;
mod rule;

pub use config::{GenerateTimeout, RuleConfig, StaleIn};
pub use engine::{Engine, Envelope, MAX_TTL};
pub use error::{CacheContents, CacheError, ConfigError};
pub use generate::{Generated, Generator};
pub use key::{CacheKey, validate_segment_name};
pub use policy::{CachedInfo, Detailed, Policy, PolicyBuilder, StatsSnapshot};
pub use rule::{Rule, StaleRule};
