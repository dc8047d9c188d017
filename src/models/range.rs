//! Inclusive time ranges over aligned candle open times

use super::Timeframe;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Start/end instant pair (both inclusive) plus the exact candle count it should hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub expected_count: Option<i64>,
}

impl TimeRange {
    /// Range with no expected count attached
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            expected_count: None,
        }
    }

    /// Range whose expected count is derived from the timeframe step
    pub fn for_timeframe(start: DateTime<Utc>, end: DateTime<Utc>, timeframe: Timeframe) -> Self {
        let mut range = Self::new(start, end);
        range.expected_count = Some(range.count(timeframe));
        range
    }

    /// `count` candles beginning at `start`; saturates at `DateTime::MAX_UTC`
    pub fn from_start(start: DateTime<Utc>, count: i64, timeframe: Timeframe) -> Self {
        Self::try_from_start(start, count, timeframe)
            .unwrap_or_else(|| Self::for_timeframe(start, DateTime::<Utc>::MAX_UTC, timeframe))
    }

    /// `count` candles ending at `end`; saturates at `DateTime::MIN_UTC`
    pub fn ending_at(end: DateTime<Utc>, count: i64, timeframe: Timeframe) -> Self {
        Self::try_ending_at(end, count, timeframe)
            .unwrap_or_else(|| Self::for_timeframe(DateTime::<Utc>::MIN_UTC, end, timeframe))
    }

    /// `count` candles beginning at `start`, or None if the end is not representable
    pub fn try_from_start(start: DateTime<Utc>, count: i64, timeframe: Timeframe) -> Option<Self> {
        let span = Duration::try_seconds(timeframe.seconds().checked_mul(count.max(1) - 1)?)?;
        let end = start.checked_add_signed(span)?;
        Some(Self::for_timeframe(start, end, timeframe))
    }

    /// `count` candles ending at `end`, or None if the start is not representable
    pub fn try_ending_at(end: DateTime<Utc>, count: i64, timeframe: Timeframe) -> Option<Self> {
        let span = Duration::try_seconds(timeframe.seconds().checked_mul(count.max(1) - 1)?)?;
        let start = end.checked_sub_signed(span)?;
        Some(Self::for_timeframe(start, end, timeframe))
    }

    /// Number of candle slots between start and end, inclusive
    pub fn count(&self, timeframe: Timeframe) -> i64 {
        if self.end < self.start {
            return 0;
        }
        (self.end - self.start).num_seconds() / timeframe.seconds() + 1
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }

    /// Overlapping part of two ranges
    pub fn intersection(&self, other: &TimeRange, timeframe: Timeframe) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then(|| TimeRange::for_timeframe(start, end, timeframe))
    }

    /// Merged range, only when the two overlap or sit exactly one step apart
    pub fn union(&self, other: &TimeRange, timeframe: Timeframe) -> Option<TimeRange> {
        let (first, second) = if self.start <= other.start {
            (self, other)
        } else {
            (other, self)
        };
        if second.start <= first.end || first.is_continuous_with(second, timeframe) {
            let end = first.end.max(second.end);
            Some(TimeRange::for_timeframe(first.start, end, timeframe))
        } else {
            None
        }
    }

    /// Same range moved by `n` steps (negative moves it back)
    pub fn shift(&self, n: i64, timeframe: Timeframe) -> TimeRange {
        TimeRange {
            start: self.start + steps(timeframe, n),
            end: self.end + steps(timeframe, n),
            expected_count: self.expected_count,
        }
    }

    /// True when `next` begins exactly one step after this range ends.
    /// No tolerance: a hole of even one candle is not continuous.
    pub fn is_continuous_with(&self, next: &TimeRange, timeframe: Timeframe) -> bool {
        (next.start - self.end).num_seconds() == timeframe.seconds()
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {}]", self.start.to_rfc3339(), self.end.to_rfc3339())?;
        if let Some(count) = self.expected_count {
            write!(f, " ({} candles)", count)?;
        }
        Ok(())
    }
}

/// One timeframe step as a chrono duration
pub fn step(timeframe: Timeframe) -> Duration {
    Duration::seconds(timeframe.seconds())
}

/// `n` timeframe steps
pub fn steps(timeframe: Timeframe, n: i64) -> Duration {
    Duration::seconds(timeframe.seconds() * n)
}
