use std::num::ParseIntError;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_CALLS: u64 = 100;
pub const DEFAULT_PERIOD_SECONDS: u64 = 60;

/// Environment variable holding the number of calls admitted per period.
pub const CALLS_VAR: &str = "RATE_LIMIT_CALLS";
/// Environment variable holding the period length in whole seconds.
pub const PERIOD_VAR: &str = "RATE_LIMIT_PERIOD";

#[derive(Debug, Error)]
pub enum Error {
    #[error("max_calls must be greater than zero")]
    ZeroMaxCalls,
    #[error("period must be greater than zero")]
    ZeroPeriod,
    #[error("Invalid value {value:?} for {name}: {source}")]
    InvalidVariable {
        name: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
}

/// The quota enforced by a sliding window rate limiter.
///
/// A policy admits at most `max_calls` requests per key within any trailing `period`. It is
/// validated on construction and cannot be changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    max_calls: u64,
    period: Duration,
}

impl Policy {
    /// Fails if either `max_calls` or `period` is zero.
    pub fn new(max_calls: u64, period: Duration) -> Result<Self, Error> {
        if max_calls == 0 {
            return Err(Error::ZeroMaxCalls);
        }
        if period.is_zero() {
            return Err(Error::ZeroPeriod);
        }
        Ok(Self { max_calls, period })
    }

    /// Load a policy from [CALLS_VAR] and [PERIOD_VAR].
    ///
    /// Unset variables fall back to [DEFAULT_MAX_CALLS] and [DEFAULT_PERIOD_SECONDS]; variables
    /// that are set but unparsable or zero are rejected.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [Policy::from_env] but reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_calls = parse_var(&lookup, CALLS_VAR, DEFAULT_MAX_CALLS)?;
        let period = parse_var(&lookup, PERIOD_VAR, DEFAULT_PERIOD_SECONDS)?;
        Self::new(max_calls, Duration::from_secs(period))
    }

    /// The total requests to be admitted within the period.
    pub fn max_calls(&self) -> u64 {
        self.max_calls
    }

    /// The length of the sliding window.
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_calls: DEFAULT_MAX_CALLS,
            period: Duration::from_secs(DEFAULT_PERIOD_SECONDS),
        }
    }
}

fn parse_var<F>(lookup: &F, name: &'static str, default: u64) -> Result<u64, Error>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map_err(|source| Error::InvalidVariable {
                name,
                value,
                source,
            }),
    }
}
