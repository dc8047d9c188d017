//! Overlap Analyzer
//!
//! Classifies a requested range against what the store already holds and
//! estimates how many upstream calls would close the difference.

use crate::db::{CandleStore, RangeBounds};
use crate::error::Result;
use crate::models::{step, SeriesKey, TimeRange};
use crate::time_utils::{calls_for, split_into_chunks};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Relationship between a requested range and the stored series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverlapStatus {
    NoOverlap,
    CompleteOverlap,
    PartialStart,
    PartialMiddleFragmented,
    PartialMiddleContinuous,
}

impl OverlapStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OverlapStatus::NoOverlap => "no_overlap",
            OverlapStatus::CompleteOverlap => "complete_overlap",
            OverlapStatus::PartialStart => "partial_start",
            OverlapStatus::PartialMiddleFragmented => "partial_middle_fragmented",
            OverlapStatus::PartialMiddleContinuous => "partial_middle_continuous",
        }
    }
}

impl fmt::Display for OverlapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapResult {
    pub status: OverlapStatus,
    pub requested: TimeRange,
    /// Stored rows inside the requested range
    pub cached: Option<RangeBounds>,
    /// End of the contiguous run starting at the earliest stored row
    pub last_continuous_boundary: Option<DateTime<Utc>>,
    /// Holes between stored rows
    pub gaps: Vec<TimeRange>,
    /// Every span that must come from upstream: leading edge, gaps, trailing edge
    pub missing: Vec<TimeRange>,
    pub estimated_calls: usize,
}

impl OverlapResult {
    pub fn cached_count(&self) -> i64 {
        self.cached.map(|c| c.count).unwrap_or(0)
    }
}

/// Stateless classifier; construct one per service
#[derive(Debug, Clone, Copy)]
pub struct OverlapAnalyzer {
    max_per_call: i64,
}

impl OverlapAnalyzer {
    pub fn new(max_per_call: i64) -> Self {
        Self {
            max_per_call: max_per_call.max(1),
        }
    }

    /// Classify `requested` against the store.
    ///
    /// Runs in order, first match wins: no stored row, exact count present,
    /// cached start equals requested start, two or more gaps, otherwise one
    /// contiguous hole.
    pub fn analyze(
        &self,
        store: &CandleStore,
        key: &SeriesKey,
        requested: &TimeRange,
    ) -> Result<OverlapResult> {
        let timeframe = key.timeframe;
        let expected = requested.count(timeframe);

        if !store.has_any_data_in(key, requested)? {
            let estimated_calls = split_into_chunks(requested, timeframe, self.max_per_call).len();
            debug!("{} {}: no overlap, {} call(s)", key, requested, estimated_calls);
            return Ok(OverlapResult {
                status: OverlapStatus::NoOverlap,
                requested: *requested,
                cached: None,
                last_continuous_boundary: None,
                gaps: Vec::new(),
                missing: vec![*requested],
                estimated_calls,
            });
        }

        let cached = store.get_range_bounds(key, requested)?;

        if store.is_range_complete(key, requested, expected)? {
            debug!("{} {}: complete overlap", key, requested);
            return Ok(OverlapResult {
                status: OverlapStatus::CompleteOverlap,
                requested: *requested,
                last_continuous_boundary: cached.map(|c| c.max),
                cached,
                gaps: Vec::new(),
                missing: Vec::new(),
                estimated_calls: 0,
            });
        }

        let gaps = store.find_gaps(key, requested)?;
        let last_continuous_boundary = store.find_last_continuous_boundary(key, requested)?;

        let missing = missing_spans(requested, cached, &gaps, key);
        let estimated_calls = missing
            .iter()
            .map(|span| calls_for(span.count(timeframe), self.max_per_call))
            .sum();

        let status = match cached {
            Some(bounds) if bounds.min == requested.start => OverlapStatus::PartialStart,
            _ if gaps.len() >= 2 => OverlapStatus::PartialMiddleFragmented,
            _ => OverlapStatus::PartialMiddleContinuous,
        };

        debug!(
            "{} {}: {} ({} cached, {} gap(s), {} call(s))",
            key,
            requested,
            status,
            cached.map(|c| c.count).unwrap_or(0),
            gaps.len(),
            estimated_calls
        );

        Ok(OverlapResult {
            status,
            requested: *requested,
            cached,
            last_continuous_boundary,
            gaps,
            missing,
            estimated_calls,
        })
    }
}

/// Leading edge, internal gaps and trailing edge, oldest first
fn missing_spans(
    requested: &TimeRange,
    cached: Option<RangeBounds>,
    gaps: &[TimeRange],
    key: &SeriesKey,
) -> Vec<TimeRange> {
    let timeframe = key.timeframe;
    let Some(bounds) = cached else {
        return vec![*requested];
    };

    let mut spans = Vec::with_capacity(gaps.len() + 2);
    if bounds.min > requested.start {
        spans.push(TimeRange::for_timeframe(
            requested.start,
            bounds.min - step(timeframe),
            timeframe,
        ));
    }
    spans.extend_from_slice(gaps);
    if bounds.max < requested.end {
        spans.push(TimeRange::for_timeframe(
            bounds.max + step(timeframe),
            requested.end,
            timeframe,
        ));
    }
    spans
}
