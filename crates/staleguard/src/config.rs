use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::de::{Deserialize, Deserializer, Error as _};

/// The staleness threshold of a rule.
///
/// Either a fixed duration, or a function evaluated at read time against the
/// entry's creation timestamp and remaining ttl. The computed form allows
/// policies where the staleness window depends on how much life an entry has
/// left (for example "stale for the last quarter of its ttl").
#[derive(Clone)]
pub enum StaleIn {
    Fixed(Duration),
    Computed(Arc<dyn Fn(SystemTime, Duration) -> Duration + Send + Sync>),
}

impl StaleIn {
    /// Creates a computed staleness threshold from a closure.
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(SystemTime, Duration) -> Duration + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    /// The age at which an entry stored at `stored_at` with `ttl` remaining
    /// becomes stale.
    pub fn threshold(&self, stored_at: SystemTime, ttl: Duration) -> Duration {
        match self {
            Self::Fixed(d) => *d,
            Self::Computed(f) => f(stored_at, ttl),
        }
    }

    pub(crate) fn as_fixed(&self) -> Option<Duration> {
        match self {
            Self::Fixed(d) => Some(*d),
            Self::Computed(_) => None,
        }
    }
}

impl fmt::Debug for StaleIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Computed(_) => f.debug_tuple("Computed").field(&"..").finish(),
        }
    }
}

impl From<Duration> for StaleIn {
    fn from(d: Duration) -> Self {
        Self::Fixed(d)
    }
}

impl<'de> Deserialize<'de> for StaleIn {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Only the fixed form is expressible in configuration files; computed
        // thresholds are attached programmatically.
        humantime_serde::deserialize(deserializer).map(StaleIn::Fixed)
    }
}

/// How long a caller synchronously waits for a generation it joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateTimeout {
    /// Give each waiting caller a [`CacheError::Timeout`] after this duration.
    ///
    /// [`CacheError::Timeout`]: crate::CacheError::Timeout
    After(Duration),
    /// Wait until the generation delivers, however long that takes. A
    /// generator that never completes blocks all of its joiners indefinitely.
    Disabled,
}

impl GenerateTimeout {
    /// The wait bound, or `None` when the timeout is disabled.
    pub fn bound(&self) -> Option<Duration> {
        match self {
            Self::After(d) => Some(*d),
            Self::Disabled => None,
        }
    }
}

impl From<Duration> for GenerateTimeout {
    fn from(d: Duration) -> Self {
        Self::After(d)
    }
}

impl<'de> Deserialize<'de> for GenerateTimeout {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Duration(#[serde(with = "humantime_serde")] Duration),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => Ok(GenerateTimeout::Disabled),
            Raw::Flag(true) => Err(D::Error::custom(
                "`generate_timeout` must be a duration or `false` to disable it",
            )),
            Raw::Duration(d) => Ok(GenerateTimeout::After(d)),
        }
    }
}

/// Raw, unvalidated policy configuration.
///
/// This is what configuration files deserialize into; [`Rule::compile`]
/// validates it and produces the immutable [`Rule`] the policy runs on.
/// All durations accept humantime strings (`"5s"`, `"100ms"`, `"1h 30m"`).
///
/// [`Rule`]: crate::Rule
/// [`Rule::compile`]: crate::Rule::compile
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleConfig {
    /// Relative expiry: entries expire this long after they were stored.
    #[serde(with = "humantime_serde")]
    pub expires_in: Option<Duration>,

    /// Absolute expiry: entries expire at this wall-clock time of day
    /// (`"H:MM"` or `"HH:MM"`), anchored to the entry's creation day and
    /// rolling over to the next day if the time has already passed.
    pub expires_at: Option<String>,

    /// Age at which an entry is served stale while a refresh runs in the
    /// background. Requires `stale_timeout` and a generator.
    pub stale_in: Option<StaleIn>,

    /// Wait bound for the synchronous generation a stale hit falls back to
    /// when the entry is about to fully expire.
    #[serde(with = "humantime_serde")]
    pub stale_timeout: Option<Duration>,

    /// Maximum age of an in-flight generation that a stale hit will join
    /// instead of starting another one. Unset restores the legacy behavior
    /// where every stale hit triggers its own background refresh.
    #[serde(with = "humantime_serde")]
    pub pending_generate_timeout: Option<Duration>,

    /// Wait bound for callers blocked on a cache miss. Must be set exactly
    /// when a generator is attached.
    pub generate_timeout: Option<GenerateTimeout>,

    /// Drop the cached entry when a generation attempt fails, so the next
    /// caller regenerates from scratch instead of reviving a stale value.
    /// Defaults to true.
    pub drop_on_error: Option<bool>,

    /// Treat a storage read error like a miss and generate, instead of
    /// surfacing the error. Defaults to true.
    pub generate_on_read_error: Option<bool>,

    /// Swallow storage write errors after a successful generation and return
    /// the generated value anyway. Defaults to true.
    pub generate_ignore_write_error: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_durations() {
        let config: RuleConfig = serde_json::from_str(
            r#"{
                "expires_in": "50s",
                "stale_in": "20s",
                "stale_timeout": "5s",
                "pending_generate_timeout": "10s",
                "generate_timeout": "2s"
            }"#,
        )
        .unwrap();

        assert_eq!(config.expires_in, Some(Duration::from_secs(50)));
        assert_eq!(
            config.stale_in.unwrap().as_fixed(),
            Some(Duration::from_secs(20))
        );
        assert_eq!(config.stale_timeout, Some(Duration::from_secs(5)));
        assert_eq!(
            config.generate_timeout,
            Some(GenerateTimeout::After(Duration::from_secs(2)))
        );
    }

    #[test]
    fn test_deserialize_disabled_generate_timeout() {
        let config: RuleConfig =
            serde_json::from_str(r#"{ "expires_in": "1m", "generate_timeout": false }"#).unwrap();
        assert_eq!(config.generate_timeout, Some(GenerateTimeout::Disabled));

        let res = serde_json::from_str::<RuleConfig>(
            r#"{ "expires_in": "1m", "generate_timeout": true }"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let res = serde_json::from_str::<RuleConfig>(r#"{ "expires_inn": "1m" }"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_computed_stale_in() {
        let stale_in = StaleIn::computed(|_, ttl| ttl / 4);
        let threshold = stale_in.threshold(SystemTime::now(), Duration::from_secs(100));
        assert_eq!(threshold, Duration::from_secs(25));
    }
}
