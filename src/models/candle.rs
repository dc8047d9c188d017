//! OHLCV records and series identity

use super::Timeframe;
use crate::error::{Result, SyncError};
use crate::time_utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one logical series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.timeframe)
    }
}

/// One OHLCV observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRecord {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub quote_volume: f64,
    pub base_volume: f64,
    /// Exchange-native sequence number
    pub sequence: i64,
}

impl CandleRecord {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.timeframe)
    }

    /// Check price/volume invariants and boundary alignment
    pub fn validate(&self) -> Result<()> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(self.invalid("prices must be positive and finite"));
        }
        if self.high < self.open.max(self.close).max(self.low) {
            return Err(self.invalid("high is below open/close/low"));
        }
        if self.low > self.open.min(self.close).min(self.high) {
            return Err(self.invalid("low is above open/close/high"));
        }
        let volumes = [self.quote_volume, self.base_volume];
        if volumes.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(self.invalid("volumes must be non-negative and finite"));
        }
        if time_utils::align(self.open_time, self.timeframe) != self.open_time {
            return Err(self.invalid("open_time is not on a timeframe boundary"));
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> SyncError {
        SyncError::Validation(format!(
            "{} candle at {}: {}",
            self.series_key(),
            self.open_time.to_rfc3339(),
            reason
        ))
    }
}
