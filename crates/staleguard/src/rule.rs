use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, TimeDelta};

use crate::config::{GenerateTimeout, RuleConfig, StaleIn};
use crate::error::ConfigError;

/// Entries older than a day cannot be reasoned about relative to a daily
/// wall-clock anchor and are treated as expired.
const DAY: Duration = Duration::from_secs(24 * 3600);

/// When a rule-governed entry hard-expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    /// A fixed duration after the entry was stored.
    In(Duration),
    /// At a wall-clock time of day, anchored to the entry's creation day and
    /// rolling over to the next day if the time has already passed.
    At { hour: u32, minute: u32 },
}

/// The staleness window of a rule.
#[derive(Debug, Clone)]
pub struct StaleRule {
    /// Age at which an entry is served stale.
    pub stale_in: StaleIn,
    /// Wait bound for the synchronous generation a stale hit degrades to when
    /// the entry is about to hard-expire.
    pub stale_timeout: Duration,
}

/// A compiled, immutable cache policy rule.
///
/// Produced by [`Rule::compile`] from a [`RuleConfig`]; every invariant of the
/// configuration surface is checked there, so a `Rule` in hand is always
/// internally consistent.
#[derive(Debug, Clone)]
pub struct Rule {
    expiry: Expiry,
    stale: Option<StaleRule>,
    pending_generate_timeout: Option<Duration>,
    generate_timeout: Option<GenerateTimeout>,
    drop_on_error: bool,
    generate_on_read_error: bool,
    generate_ignore_write_error: bool,
}

impl Rule {
    /// Validates `config` and compiles it into a [`Rule`].
    ///
    /// `has_generator` states whether a generator is attached to the policy;
    /// generation-related options are only valid together with one.
    pub fn compile(config: &RuleConfig, has_generator: bool) -> Result<Self, ConfigError> {
        let expiry = match (config.expires_in, config.expires_at.as_deref()) {
            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousExpiry),
            (None, None) => return Err(ConfigError::MissingExpiry),
            (Some(expires_in), None) => Expiry::In(expires_in),
            (None, Some(s)) => {
                let (hour, minute) = parse_clock(s)?;
                Expiry::At { hour, minute }
            }
        };

        let stale = match (config.stale_in.clone(), config.stale_timeout) {
            (None, None) => None,
            (Some(stale_in), Some(stale_timeout)) => Some(StaleRule {
                stale_in,
                stale_timeout,
            }),
            _ => return Err(ConfigError::IncompleteStaleRule),
        };

        if let Some(stale) = &stale {
            if !has_generator {
                return Err(ConfigError::StaleRequiresGenerator);
            }

            // Computed thresholds are evaluated at read time and cannot be
            // checked here; only the fixed form is validated upfront.
            if let (Expiry::In(expires_in), Some(stale_in)) = (expiry, stale.stale_in.as_fixed()) {
                if stale_in >= expires_in {
                    return Err(ConfigError::StaleInTooLarge);
                }
                if stale.stale_timeout >= expires_in - stale_in {
                    return Err(ConfigError::StaleTimeoutTooLarge);
                }
            }
            if let (Expiry::At { .. }, Some(stale_in)) = (expiry, stale.stale_in.as_fixed()) {
                if stale_in >= DAY {
                    return Err(ConfigError::StaleInBeyondDay);
                }
            }

            if let Some(pending) = config.pending_generate_timeout {
                if pending <= stale.stale_timeout {
                    return Err(ConfigError::PendingGenerateTimeoutTooSmall);
                }
            }
        }

        if has_generator != config.generate_timeout.is_some() {
            return Err(ConfigError::IncompleteGenerateRule);
        }

        Ok(Rule {
            expiry,
            stale,
            pending_generate_timeout: config.pending_generate_timeout,
            generate_timeout: config.generate_timeout,
            drop_on_error: config.drop_on_error.unwrap_or(true),
            generate_on_read_error: config.generate_on_read_error.unwrap_or(true),
            generate_ignore_write_error: config.generate_ignore_write_error.unwrap_or(true),
        })
    }

    /// The remaining time-to-live of an entry stored at `stored_at`.
    ///
    /// Returns [`Duration::ZERO`] for entries that are expired, stored in the
    /// future (clock skew), or too old to anchor against a daily wall-clock
    /// expiry. With `stored_at == now` this yields the full ttl to hand to a
    /// storage engine write.
    pub fn ttl(&self, stored_at: SystemTime, now: SystemTime) -> Duration {
        let Ok(age) = now.duration_since(stored_at) else {
            return Duration::ZERO;
        };

        match self.expiry {
            Expiry::In(expires_in) => expires_in.saturating_sub(age),
            Expiry::At { hour, minute } => {
                if age > DAY {
                    return Duration::ZERO;
                }

                let stored: DateTime<Local> = stored_at.into();
                let Some(anchor) = stored.date_naive().and_hms_opt(hour, minute, 0) else {
                    return Duration::ZERO;
                };
                let Some(anchor) = anchor.and_local_timezone(Local).earliest() else {
                    return Duration::ZERO;
                };

                let mut delta = anchor.signed_duration_since(stored);
                if delta <= TimeDelta::zero() {
                    delta += TimeDelta::hours(24);
                }
                let Ok(delta) = delta.to_std() else {
                    return Duration::ZERO;
                };
                delta.saturating_sub(age)
            }
        }
    }

    pub fn stale(&self) -> Option<&StaleRule> {
        self.stale.as_ref()
    }

    pub fn pending_generate_timeout(&self) -> Option<Duration> {
        self.pending_generate_timeout
    }

    pub fn generate_timeout(&self) -> Option<GenerateTimeout> {
        self.generate_timeout
    }

    pub fn drop_on_error(&self) -> bool {
        self.drop_on_error
    }

    pub fn generate_on_read_error(&self) -> bool {
        self.generate_on_read_error
    }

    pub fn generate_ignore_write_error(&self) -> bool {
        self.generate_ignore_write_error
    }
}

/// Parses an `H:MM` / `HH:MM` time-of-day string.
fn parse_clock(s: &str) -> Result<(u32, u32), ConfigError> {
    let Some((h, m)) = s.split_once(':') else {
        return Err(ConfigError::InvalidTimeString);
    };
    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if h.is_empty() || h.len() > 2 || m.len() != 2 || !digits(h) || !digits(m) {
        return Err(ConfigError::InvalidTimeString);
    }

    // The unwraps cannot fail: both halves are 1-2 ASCII digits.
    let hour: u32 = h.parse().unwrap();
    let minute: u32 = m.parse().unwrap();
    if hour > 23 || minute > 59 {
        return Err(ConfigError::InvalidTimeString);
    }
    Ok((hour, minute))
}
