//! Time arithmetic for candle boundaries
//!
//! Pure functions: timeframe lengths, boundary alignment, request normalization
//! and splitting a range into upstream-sized chunks.

use crate::error::{Result, SyncError};
use crate::models::{step, steps, TimeRange, Timeframe};
use chrono::{DateTime, Duration, Utc};

/// Upstream per-call record limit
pub const MAX_CANDLES_PER_CALL: i64 = 200;

/// Candle length in seconds
pub fn seconds_for(timeframe: Timeframe) -> i64 {
    timeframe.seconds()
}

/// Round an instant down to the nearest candle boundary; saturates at `DateTime::MIN_UTC`
pub fn align(instant: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    checked_align(instant, timeframe).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// [`align`], or None when the boundary is before the earliest representable instant
pub fn checked_align(instant: DateTime<Utc>, timeframe: Timeframe) -> Option<DateTime<Utc>> {
    let secs = instant.timestamp() + timeframe.alignment_offset();
    let rem = secs.rem_euclid(timeframe.seconds());
    instant
        .checked_sub_signed(Duration::seconds(rem))?
        .checked_sub_signed(Duration::nanoseconds(i64::from(instant.timestamp_subsec_nanos())))
}

/// Open time of the most recent fully closed candle
pub fn last_closed(now: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    align(now, timeframe) - step(timeframe)
}

fn out_of_range(what: &str) -> SyncError {
    SyncError::InvalidRange(format!("{} is outside the supported time range", what))
}

/// Store primary key for an instant
pub fn epoch_seconds(instant: DateTime<Utc>) -> i64 {
    instant.timestamp()
}

/// Instant for a store primary key
pub fn from_epoch_seconds(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| SyncError::Internal(format!("Timestamp out of range: {}", secs)))
}

/// Resolve a (count, start, end) request into one canonical aligned range.
///
/// Accepted combinations: count; count+start; count+end; start+end; start.
/// Open-ended requests end at the last closed candle before `now`.
pub fn normalize(
    count: Option<i64>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    timeframe: Timeframe,
    now: DateTime<Utc>,
    max_count: i64,
) -> Result<TimeRange> {
    if let Some(count) = count {
        if count <= 0 {
            return Err(SyncError::InvalidRange(format!(
                "count must be positive, got {}",
                count
            )));
        }
        if count > max_count {
            return Err(SyncError::InvalidRange(format!(
                "count {} exceeds the maximum of {}",
                count, max_count
            )));
        }
    }
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            return Err(SyncError::InvalidRange(format!(
                "start {} is after end {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
    }

    let aligned = |instant: DateTime<Utc>, what: &str| {
        checked_align(instant, timeframe).ok_or_else(|| out_of_range(what))
    };
    let latest = last_closed(now, timeframe);

    let range = match (count, start, end) {
        (Some(count), None, None) => TimeRange::try_ending_at(latest, count, timeframe)
            .ok_or_else(|| out_of_range("range start"))?,
        (Some(count), Some(start), None) => {
            let start = aligned(start, "start")?;
            if start > latest {
                return Err(after_latest(start, latest));
            }
            let range = TimeRange::try_from_start(start, count, timeframe)
                .ok_or_else(|| out_of_range("range end"))?;
            // candles after the last closed one do not exist yet
            TimeRange::for_timeframe(range.start, range.end.min(latest), timeframe)
        }
        (Some(count), None, Some(end)) => {
            TimeRange::try_ending_at(aligned(end, "end")?, count, timeframe)
                .ok_or_else(|| out_of_range("range start"))?
        }
        (None, Some(start), Some(end)) => {
            TimeRange::for_timeframe(aligned(start, "start")?, aligned(end, "end")?, timeframe)
        }
        (None, Some(start), None) => {
            let start = aligned(start, "start")?;
            if start > latest {
                return Err(after_latest(start, latest));
            }
            TimeRange::for_timeframe(start, latest, timeframe)
        }
        (Some(_), Some(_), Some(_)) => {
            return Err(SyncError::InvalidRange(
                "count, start and end cannot all be given".to_string(),
            ))
        }
        (None, None, _) => {
            return Err(SyncError::InvalidRange(
                "either count or start is required".to_string(),
            ))
        }
    };

    let expected = range.count(timeframe);
    if expected > max_count {
        return Err(SyncError::InvalidRange(format!(
            "range spans {} candles, exceeding the maximum of {}",
            expected, max_count
        )));
    }
    Ok(range)
}

fn after_latest(start: DateTime<Utc>, latest: DateTime<Utc>) -> SyncError {
    SyncError::InvalidRange(format!(
        "start {} is after the latest closed candle {}",
        start.to_rfc3339(),
        latest.to_rfc3339()
    ))
}

/// Split a range into contiguous, non-overlapping chunks of at most `max_per_chunk`
/// candles, newest first. The last (oldest) chunk covers the exact remainder.
pub fn split_into_chunks(
    range: &TimeRange,
    timeframe: Timeframe,
    max_per_chunk: i64,
) -> Vec<TimeRange> {
    let max_per_chunk = max_per_chunk.max(1);
    let mut chunks = Vec::new();
    let mut remaining = range.count(timeframe);
    let mut end = range.end;

    while remaining > 0 {
        let size = remaining.min(max_per_chunk);
        let chunk = TimeRange::ending_at(end, size, timeframe);
        end = chunk.start - step(timeframe);
        remaining -= size;
        chunks.push(chunk);
    }

    chunks
}

/// Number of upstream calls needed to cover `candles` candles
pub fn calls_for(candles: i64, max_per_call: i64) -> usize {
    if candles <= 0 {
        return 0;
    }
    let max_per_call = max_per_call.max(1);
    ((candles + max_per_call - 1) / max_per_call) as usize
}

/// Upstream `to` argument for a span ending at `end`.
///
/// The upstream excludes the candle at `to` itself, so the true boundary is
/// `end + step`; backing off half a step keeps `end` inside the response.
pub fn upstream_anchor(end: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    end + steps(timeframe, 1) / 2
}
