//! Candle timeframes

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed duration each candle represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "3m")]
    Minute3,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "2h")]
    Hour2,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
    /// Weekly candles open on Monday 00:00 UTC
    #[serde(rename = "1w")]
    Week1,
}

impl Timeframe {
    /// All supported timeframes, shortest first
    pub const ALL: [Timeframe; 10] = [
        Timeframe::Minute1,
        Timeframe::Minute3,
        Timeframe::Minute5,
        Timeframe::Minute15,
        Timeframe::Minute30,
        Timeframe::Hour1,
        Timeframe::Hour2,
        Timeframe::Hour4,
        Timeframe::Day1,
        Timeframe::Week1,
    ];

    /// Candle length in seconds
    pub const fn seconds(self) -> i64 {
        match self {
            Timeframe::Minute1 => 60,
            Timeframe::Minute3 => 180,
            Timeframe::Minute5 => 300,
            Timeframe::Minute15 => 900,
            Timeframe::Minute30 => 1_800,
            Timeframe::Hour1 => 3_600,
            Timeframe::Hour2 => 7_200,
            Timeframe::Hour4 => 14_400,
            Timeframe::Day1 => 86_400,
            Timeframe::Week1 => 604_800,
        }
    }

    /// Offset added before flooring so boundaries land on the right weekday.
    /// The epoch was a Thursday; Monday boundaries sit three days later in the cycle.
    pub(crate) const fn alignment_offset(self) -> i64 {
        match self {
            Timeframe::Week1 => 3 * 86_400,
            _ => 0,
        }
    }

    /// Interval label, as used on the wire and in table names
    pub const fn as_str(self) -> &'static str {
        match self {
            Timeframe::Minute1 => "1m",
            Timeframe::Minute3 => "3m",
            Timeframe::Minute5 => "5m",
            Timeframe::Minute15 => "15m",
            Timeframe::Minute30 => "30m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour2 => "2h",
            Timeframe::Hour4 => "4h",
            Timeframe::Day1 => "1d",
            Timeframe::Week1 => "1w",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim();
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(label))
            .ok_or_else(|| SyncError::Validation(format!("Unsupported timeframe: {}", s)))
    }
}
