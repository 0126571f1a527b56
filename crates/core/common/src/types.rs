//! Core value types for the price sampler

use crate::constants::fixed_point::{PRICE_DECIMALS, PRICE_SCALE};
use crate::constants::time::{NANOS_PER_MICRO, NANOS_PER_MILLI, NANOS_PER_SEC};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Instrument identifier as quoted by the provider (e.g. `BTCUSDT`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Create a new symbol, normalised to upper case
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_uppercase())
    }

    /// Borrow the symbol as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Errors produced while parsing a decimal price string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParsePxError {
    /// Input was empty or only a sign
    #[error("empty price string")]
    Empty,

    /// Input contained something other than digits and one decimal point
    #[error("invalid price string: {0:?}")]
    Invalid(String),

    /// Input had non-zero digits beyond the supported precision
    #[error("price {0:?} exceeds {PRICE_DECIMALS} decimal places")]
    TooPrecise(String),

    /// Value does not fit the fixed-point representation
    #[error("price {0:?} out of range")]
    Overflow(String),
}

/// Price stored as i64 ticks, 1 tick = 10^-8 units
///
/// Eight fractional digits cover crypto quotes such as `LTCBTC` exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Px(i64);

impl Px {
    /// Zero price
    pub const ZERO: Self = Self(0);

    /// Create a price from f64 (rounds to the nearest tick)
    ///
    /// For tests and external APIs only, prefer [`Px::from_str`] for provider data.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn new(value: f64) -> Self {
        let scaled = (value * PRICE_SCALE as f64).round();
        if scaled >= i64::MAX as f64 {
            Self(i64::MAX)
        } else if scaled <= i64::MIN as f64 {
            Self(i64::MIN)
        } else {
            Self(scaled as i64)
        }
    }

    /// Create from i64 ticks
    #[must_use]
    pub const fn from_i64(ticks: i64) -> Self {
        Self(ticks)
    }

    /// Create from whole units
    #[must_use]
    pub const fn from_units(units: i64) -> Self {
        Self(units * PRICE_SCALE)
    }

    /// Get price as i64 ticks
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    /// Get price as f64, may lose precision above 2^53 ticks
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / PRICE_SCALE as f64
    }

    /// True when the price is strictly positive
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

impl FromStr for Px {
    type Err = ParsePxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        if digits.is_empty() {
            return Err(ParsePxError::Empty);
        }

        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if (whole.is_empty() && frac.is_empty())
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(ParsePxError::Invalid(s.to_string()));
        }

        let decimals = PRICE_DECIMALS as usize;
        let (kept, dropped) = frac.split_at(frac.len().min(decimals));
        if dropped.bytes().any(|b| b != b'0') {
            return Err(ParsePxError::TooPrecise(s.to_string()));
        }

        let overflow = || ParsePxError::Overflow(s.to_string());
        let mut ticks: i64 = 0;
        for b in whole.bytes().chain(kept.bytes()) {
            ticks = ticks
                .checked_mul(10)
                .and_then(|t| t.checked_add(i64::from(b - b'0')))
                .ok_or_else(overflow)?;
        }
        for _ in kept.len()..decimals {
            ticks = ticks.checked_mul(10).ok_or_else(overflow)?;
        }

        Ok(Self(if negative { -ticks } else { ticks }))
    }
}

impl fmt::Display for Px {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scale = PRICE_SCALE.unsigned_abs();
        let abs = self.0.unsigned_abs();
        let sign = if self.0 < 0 { "-" } else { "" };
        let frac = format!("{:08}", abs % scale);
        // keep at least two decimals, drop the rest of the trailing zeros
        let trimmed = frac.trim_end_matches('0');
        let shown = if trimmed.len() < 2 { &frac[..2] } else { trimmed };
        write!(f, "{sign}{}.{shown}", abs / scale)
    }
}

/// Timestamp in nanoseconds since UNIX epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ts(pub u64);

impl Ts {
    /// Latest representable timestamp
    pub const MAX: Self = Self(u64::MAX);

    /// Get current timestamp
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Create timestamp from nanoseconds
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Create timestamp from whole seconds
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * NANOS_PER_SEC)
    }

    /// Convert a UTC datetime, clamping pre-epoch values to zero
    #[must_use]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let nanos = dt.timestamp_nanos_opt().unwrap_or(0);
        Self(u64::try_from(nanos).unwrap_or(0))
    }

    /// Convert to a UTC datetime
    #[must_use]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        // i64 nanoseconds cover dates up to year 2262
        DateTime::from_timestamp_nanos(i64::try_from(self.0).unwrap_or(i64::MAX))
    }

    /// Get timestamp as nanoseconds
    #[must_use]
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Get timestamp as microseconds
    #[must_use]
    pub const fn as_micros(&self) -> u64 {
        self.0 / NANOS_PER_MICRO
    }

    /// Get timestamp as milliseconds
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0 / NANOS_PER_MILLI
    }

    /// Get timestamp as whole seconds
    #[must_use]
    pub const fn as_secs(&self) -> u64 {
        self.0 / NANOS_PER_SEC
    }

    /// Add a duration, saturating at `u64::MAX` nanoseconds
    #[must_use]
    pub fn saturating_add(self, d: Duration) -> Self {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    /// Duration elapsed since `earlier`, zero if `earlier` is later
    #[must_use]
    pub const fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Ts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_datetime().to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}
