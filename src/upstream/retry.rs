//! Retry with exponential backoff for upstream calls

use super::{CandleFetcher, DispatchThrottle};
use crate::config::UpstreamConfig;
use crate::error::{Result, SyncError};
use crate::models::{CandleRecord, Timeframe};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl From<&UpstreamConfig> for RetryPolicy {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), without jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff plus up to half a base delay of random jitter
    fn jittered(&self, retry: u32) -> Duration {
        let jitter_ms = (self.base_delay.as_millis() / 2) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(retry) + Duration::from_millis(jitter)
    }
}

/// Call the fetcher until it succeeds, fails with a non-retryable error, or
/// runs out of attempts. Exhaustion surfaces as `UpstreamUnavailable`.
///
/// The caller holds the throttle slot for the first attempt; every retry
/// waits out its backoff and then takes a fresh slot from `throttle`.
pub async fn fetch_with_retry(
    fetcher: &dyn CandleFetcher,
    policy: &RetryPolicy,
    throttle: &DispatchThrottle,
    symbol: &str,
    timeframe: Timeframe,
    to: DateTime<Utc>,
    count: u32,
) -> Result<Vec<CandleRecord>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fetcher.fetch(symbol, timeframe, to, count).await {
            Ok(records) => return Ok(records),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.jittered(attempt);
                tracing::warn!(
                    "Upstream fetch {} {} to {} failed (attempt {}/{}): {}; retrying in {}ms",
                    symbol,
                    timeframe,
                    to.to_rfc3339(),
                    attempt,
                    policy.max_attempts,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                throttle.acquire().await;
            }
            Err(e) if e.is_retryable() => {
                return Err(SyncError::UpstreamUnavailable {
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at_minute, MockFetcher};
    use tokio::time::Instant;

    fn unthrottled() -> DispatchThrottle {
        DispatchThrottle::new(Duration::ZERO)
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(4), Duration::from_millis(4_000));
        assert_eq!(policy.backoff(5), Duration::from_secs(8));
        assert_eq!(policy.backoff(30), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_stays_within_half_base() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.jittered(1);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(750));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let fetcher = MockFetcher::new();
        fetcher.fail_next(SyncError::Upstream("timeout".into()));
        fetcher.fail_next(SyncError::Upstream("502".into()));

        let records = fetch_with_retry(
            &fetcher,
            &RetryPolicy::default(),
            &unthrottled(),
            "BTC-USDT",
            Timeframe::Minute1,
            at_minute(10),
            5,
        )
        .await
        .unwrap();

        assert_eq!(records.len(), 5);
        assert_eq!(fetcher.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_unavailable() {
        let fetcher = MockFetcher::failing();
        let err = fetch_with_retry(
            &fetcher,
            &RetryPolicy::default(),
            &unthrottled(),
            "BTC-USDT",
            Timeframe::Minute1,
            at_minute(10),
            5,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::UpstreamUnavailable { attempts: 3, .. }));
        assert_eq!(fetcher.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_not_retried() {
        let fetcher = MockFetcher::new();
        fetcher.fail_next(SyncError::Validation("unknown symbol".into()));
        let err = fetch_with_retry(
            &fetcher,
            &RetryPolicy::default(),
            &unthrottled(),
            "NOPE",
            Timeframe::Minute1,
            at_minute(10),
            5,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_for_a_throttle_slot() {
        let fetcher = MockFetcher::new();
        fetcher.fail_next(SyncError::Upstream("503".into()));
        let throttle = DispatchThrottle::from_rpm(1);
        let started = Instant::now();

        throttle.acquire().await;
        let records = fetch_with_retry(
            &fetcher,
            &RetryPolicy::default(),
            &throttle,
            "BTC-USDT",
            Timeframe::Minute1,
            at_minute(10),
            5,
        )
        .await
        .unwrap();

        assert_eq!(records.len(), 5);
        assert_eq!(fetcher.calls().len(), 2);
        // the retry is spaced a full minute after the first call, not just the backoff
        assert!(started.elapsed() >= Duration::from_secs(60));
    }
}
