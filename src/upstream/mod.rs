//! Upstream market-data seam
//!
//! The engine never talks HTTP itself. Callers inject a [`CandleFetcher`];
//! this module throttles and retries calls made through it.

mod retry;
mod throttle;

pub use retry::{fetch_with_retry, RetryPolicy};
pub use throttle::DispatchThrottle;

use crate::error::Result;
use crate::models::{CandleRecord, Timeframe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Capability to fetch candles from the upstream API.
///
/// Returns up to `count` candles whose open times are strictly before `to`,
/// newest first. Transient failures should be reported as
/// [`SyncError::Upstream`](crate::error::SyncError::Upstream) so they are retried.
#[async_trait]
pub trait CandleFetcher: Send + Sync {
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        to: DateTime<Utc>,
        count: u32,
    ) -> Result<Vec<CandleRecord>>;
}
