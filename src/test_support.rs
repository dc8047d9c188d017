//! Shared fixtures for unit tests

use crate::config::StoreConfig;
use crate::db::CandleStore;
use crate::error::{Result, SyncError};
use crate::models::{steps, CandleRecord, Timeframe};
use crate::upstream::CandleFetcher;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tempfile::TempDir;

/// 2024-01-01T00:00:00Z plus `minutes`; a Monday, so aligned for every timeframe
pub fn at_minute(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
}

/// A valid candle at `open_time`
pub fn candle(symbol: &str, timeframe: Timeframe, open_time: DateTime<Utc>) -> CandleRecord {
    let base = 100.0 + (open_time.timestamp() % 97) as f64;
    CandleRecord {
        symbol: symbol.to_string(),
        timeframe,
        open_time,
        open: base,
        high: base + 2.0,
        low: base - 1.0,
        close: base + 1.0,
        quote_volume: base * 10.0,
        base_volume: 10.0,
        sequence: open_time.timestamp(),
    }
}

/// `count` contiguous candles from `start`, oldest first
pub fn synthetic_series(
    symbol: &str,
    timeframe: Timeframe,
    start: DateTime<Utc>,
    count: i64,
) -> Vec<CandleRecord> {
    (0..count)
        .map(|i| candle(symbol, timeframe, start + steps(timeframe, i)))
        .collect()
}

/// Store backed by a file in a fresh temp directory
pub fn temp_store() -> (TempDir, Arc<CandleStore>) {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        db_path: dir.path().join("candles.db"),
        pool_size: 4,
        ..Default::default()
    };
    let store = CandleStore::open(&config).unwrap();
    (dir, Arc::new(store))
}

/// One recorded upstream call
#[derive(Debug, Clone, PartialEq)]
pub struct FetchCall {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub to: DateTime<Utc>,
    pub count: u32,
}

/// Fetcher that serves synthetic candles and records every call.
///
/// Answers like a real exchange: `count` candles whose open times are strictly
/// before `to`, newest first. Queued failures are returned before any data.
#[derive(Default)]
pub struct MockFetcher {
    calls: Mutex<Vec<FetchCall>>,
    failures: Mutex<VecDeque<SyncError>>,
    always_fail: bool,
    max_records: Option<u32>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetcher whose every call fails with a retryable error
    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Self::default()
        }
    }

    /// Fetcher that answers every call with at most `limit` candles
    pub fn serving_at_most(limit: u32) -> Self {
        Self {
            max_records: Some(limit),
            ..Self::default()
        }
    }

    /// Fail the next call with `err`
    pub fn fail_next(&self, err: SyncError) {
        self.failures.lock().push_back(err);
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CandleFetcher for MockFetcher {
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        to: DateTime<Utc>,
        count: u32,
    ) -> Result<Vec<CandleRecord>> {
        self.calls.lock().push(FetchCall {
            symbol: symbol.to_string(),
            timeframe,
            to,
            count,
        });

        if self.always_fail {
            return Err(SyncError::Upstream("503 Service Unavailable".into()));
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }

        let newest = crate::time_utils::align(to - Duration::seconds(1), timeframe);
        let count = self.max_records.map_or(count, |limit| count.min(limit));
        Ok((0..i64::from(count))
            .map(|i| candle(symbol, timeframe, newest - steps(timeframe, i)))
            .collect())
    }
}
