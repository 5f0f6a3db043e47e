//! Presentation timestamps.
//!
//! Everything inside the scheduler compares time in one fixed unit (microseconds).
//! Decoders report timestamps in whatever unit their container uses; callers convert
//! with [`MediaTimestamp::from_unit`] before anything is queued.

use std::fmt;
use std::time::Duration;

/// Unit attached to a timestamp reported by the decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimestampUnit {
    /// Convert `value` in this unit to microseconds (saturating).
    ///
    /// Nanoseconds truncate toward zero.
    pub fn to_micros(self, value: i64) -> i64 {
        match self {
            TimestampUnit::Nanoseconds => value / 1_000,
            TimestampUnit::Microseconds => value,
            TimestampUnit::Milliseconds => value.saturating_mul(1_000),
            TimestampUnit::Seconds => value.saturating_mul(1_000_000),
        }
    }
}

/// Elapsed microseconds since the media clock epoch.
///
/// Never negative: decoder timestamps below zero are clamped when converted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaTimestamp(u64);

impl MediaTimestamp {
    pub const ZERO: MediaTimestamp = MediaTimestamp(0);

    pub const fn from_micros(us: u64) -> Self {
        Self(us)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Normalize a decoder timestamp to microseconds.
    pub fn from_unit(value: i64, unit: TimestampUnit) -> Self {
        Self(unit.to_micros(value).max(0) as u64)
    }

    /// Signed distance `self - now` in microseconds.
    ///
    /// Positive means `self` lies in the future relative to `now`.
    pub fn delta_since(self, now: MediaTimestamp) -> i64 {
        let a = i64::try_from(self.0).unwrap_or(i64::MAX);
        let b = i64::try_from(now.0).unwrap_or(i64::MAX);
        a.saturating_sub(b)
    }

    /// Unsigned span between two timestamps, zero when `earlier` is not earlier.
    pub fn span_since(self, earlier: MediaTimestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for MediaTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}s", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

/// Convert a window/capacity span to signed microseconds, saturating at `i64::MAX`.
pub fn duration_to_micros(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}
