//! Rate strings such as `100/minute`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Error parsing a rate string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateParseError {
    /// No `/` separating count and period
    #[error("Invalid rate format '{0}': expected '<count>/<period>'")]
    Format(String),

    /// Count is not a positive integer
    #[error("Invalid rate count '{0}': expected a positive integer")]
    Count(String),

    /// Period is not one of second, minute, hour, day
    #[error("Unsupported time period '{0}'")]
    Period(String),
}

/// Length of a rate window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// One second
    Second,
    /// Sixty seconds
    Minute,
    /// One hour
    Hour,
    /// One day
    Day,
}

impl Period {
    /// Window length
    #[must_use]
    pub const fn as_duration(self) -> Duration {
        match self {
            Self::Second => Duration::from_secs(1),
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(3_600),
            Self::Day => Duration::from_secs(86_400),
        }
    }

    /// Stable string code
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }
}

impl FromStr for Period {
    type Err = RateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "second" => Ok(Self::Second),
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            other => Err(RateParseError::Period(other.to_string())),
        }
    }
}

/// `limit` requests per `period`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rate {
    limit: u32,
    period: Period,
}

impl Rate {
    /// Create a rate
    ///
    /// # Errors
    /// `Count` when `limit` is zero
    pub fn new(limit: u32, period: Period) -> Result<Self, RateParseError> {
        if limit == 0 {
            return Err(RateParseError::Count(limit.to_string()));
        }
        Ok(Self { limit, period })
    }

    /// Requests allowed per window
    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// Window unit
    #[must_use]
    pub const fn period(&self) -> Period {
        self.period
    }

    /// Window length
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.period.as_duration()
    }
}

impl FromStr for Rate {
    type Err = RateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, period) = s
            .split_once('/')
            .ok_or_else(|| RateParseError::Format(s.to_string()))?;
        let limit: u32 = count
            .trim()
            .parse()
            .map_err(|_| RateParseError::Count(count.to_string()))?;
        Self::new(limit, period.parse()?)
    }
}

impl TryFrom<String> for Rate {
    type Error = RateParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rate> for String {
    fn from(rate: Rate) -> Self {
        rate.to_string()
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.limit, self.period.as_str())
    }
}
