//! Chunk Optimizer
//!
//! Walks a requested range oldest to newest in windows of at most one upstream
//! call and decides, per window, whether the store can serve it or which span
//! has to be fetched.

use crate::db::CandleStore;
use crate::error::{Result, SyncError};
use crate::models::{step, SeriesKey, TimeRange, Timeframe};
use crate::time_utils::upstream_anchor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Why a fetch was planned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchKind {
    /// The whole window is fetched
    Full,
    /// Only the part before the first stored row is fetched
    Partial,
}

/// One planned upstream call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchChunk {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub anchor_time: DateTime<Utc>,
    /// Candles this call must deliver, inclusive
    pub range: TimeRange,
    pub requested_count: u32,
    /// Value passed as the upstream `to` argument
    pub upstream_to: DateTime<Utc>,
    pub next_anchor: DateTime<Utc>,
    /// Candles still unplanned after this chunk
    pub remaining_count: i64,
    pub kind: FetchKind,
}

impl FetchChunk {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.timeframe)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlanStep {
    /// Served from the store
    Local(TimeRange),
    Fetch(FetchChunk),
}

/// Ordered plan covering a requested range, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchPlan {
    pub steps: Vec<PlanStep>,
}

impl FetchPlan {
    pub fn fetch_chunks(&self) -> impl Iterator<Item = &FetchChunk> {
        self.steps.iter().filter_map(|s| match s {
            PlanStep::Fetch(chunk) => Some(chunk),
            PlanStep::Local(_) => None,
        })
    }

    pub fn local_ranges(&self) -> impl Iterator<Item = &TimeRange> {
        self.steps.iter().filter_map(|s| match s {
            PlanStep::Local(range) => Some(range),
            PlanStep::Fetch(_) => None,
        })
    }

    /// Number of upstream calls the plan makes
    pub fn upstream_calls(&self) -> usize {
        self.fetch_chunks().count()
    }

    /// Candles the plan expects to read from the store
    pub fn local_count(&self, timeframe: Timeframe) -> i64 {
        self.local_ranges().map(|r| r.count(timeframe)).sum()
    }

    pub fn is_local_only(&self) -> bool {
        self.upstream_calls() == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkOptimizer {
    max_per_call: i64,
}

impl ChunkOptimizer {
    pub fn new(max_per_call: i64) -> Self {
        Self {
            max_per_call: max_per_call.max(1),
        }
    }

    /// Build the plan for `requested`.
    ///
    /// Per window, first match wins:
    /// (a) nothing stored: fetch the whole window;
    /// (b) exact count stored: serve locally;
    /// (c) two or more gaps: fetch the whole window;
    /// (d) otherwise serve the contiguous stored run when it starts at the
    ///     anchor, or fetch up to the first stored row when it starts later.
    pub fn plan(
        &self,
        store: &CandleStore,
        key: &SeriesKey,
        requested: &TimeRange,
    ) -> Result<FetchPlan> {
        let timeframe = key.timeframe;
        let total = requested.count(timeframe);
        // every window consumes at least one candle
        let max_iterations = total.max(0) as usize + 1;

        let mut plan = FetchPlan::default();
        let mut anchor = requested.start;
        let mut remaining = total;
        let mut iterations = 0usize;

        while remaining > 0 {
            iterations += 1;
            if iterations > max_iterations {
                return Err(stalled(key, anchor, "iteration bound exceeded"));
            }

            let window_len = remaining.min(self.max_per_call);
            let window = TimeRange::from_start(anchor, window_len, timeframe);

            let (decision, next_anchor) = if !store.has_any_data_in(key, &window)? {
                (Decision::Fetch(window, FetchKind::Full), window.end + step(timeframe))
            } else if store.is_range_complete(key, &window, window_len)? {
                (Decision::Local(window), window.end + step(timeframe))
            } else if store.find_gaps(key, &window)?.len() >= 2 {
                (Decision::Fetch(window, FetchKind::Full), window.end + step(timeframe))
            } else {
                let bounds = store
                    .get_range_bounds(key, &window)?
                    .ok_or_else(|| stalled(key, anchor, "stored rows vanished during planning"))?;
                if bounds.min == anchor {
                    let boundary = store
                        .find_last_continuous_boundary(key, &window)?
                        .unwrap_or(bounds.max);
                    let local = TimeRange::for_timeframe(anchor, boundary, timeframe);
                    (Decision::Local(local), boundary + step(timeframe))
                } else {
                    let missing =
                        TimeRange::for_timeframe(anchor, bounds.min - step(timeframe), timeframe);
                    (Decision::Fetch(missing, FetchKind::Partial), bounds.min)
                }
            };

            let consumed = (next_anchor - anchor).num_seconds() / timeframe.seconds();
            if next_anchor <= anchor || consumed < 1 || consumed > remaining {
                return Err(stalled(
                    key,
                    anchor,
                    &format!("next anchor {} consumes {} of {} remaining", next_anchor, consumed, remaining),
                ));
            }
            remaining -= consumed;

            match decision {
                Decision::Local(range) => {
                    debug!("{}: serve {} locally", key, range);
                    plan.steps.push(PlanStep::Local(range));
                }
                Decision::Fetch(range, kind) => {
                    debug!("{}: fetch {} ({:?})", key, range, kind);
                    plan.steps.push(PlanStep::Fetch(FetchChunk {
                        symbol: key.symbol.clone(),
                        timeframe,
                        anchor_time: anchor,
                        range,
                        requested_count: range.count(timeframe) as u32,
                        upstream_to: upstream_anchor(range.end, timeframe),
                        next_anchor,
                        remaining_count: remaining,
                        kind,
                    }));
                }
            }
            anchor = next_anchor;
        }

        debug!(
            "{} {}: planned {} step(s), {} upstream call(s)",
            key,
            requested,
            plan.steps.len(),
            plan.upstream_calls()
        );
        Ok(plan)
    }
}

enum Decision {
    Local(TimeRange),
    Fetch(TimeRange, FetchKind),
}

fn stalled(key: &SeriesKey, anchor: DateTime<Utc>, reason: &str) -> SyncError {
    SyncError::PlanningStalled {
        series: key.to_string(),
        anchor,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at_minute, candle, synthetic_series, temp_store};
    use chrono::Duration;

    const SYMBOL: &str = "BTC-USDT";

    fn key() -> SeriesKey {
        SeriesKey::new(SYMBOL, Timeframe::Minute1)
    }

    fn requested(first: i64, count: i64) -> TimeRange {
        TimeRange::from_start(at_minute(first), count, Timeframe::Minute1)
    }

    fn seed(store: &CandleStore, first: i64, count: i64) {
        let batch = synthetic_series(SYMBOL, Timeframe::Minute1, at_minute(first), count);
        store.upsert_batch(&key(), &batch).unwrap();
    }

    fn fetch_sizes(plan: &FetchPlan) -> Vec<u32> {
        plan.fetch_chunks().map(|c| c.requested_count).collect()
    }

    #[test]
    fn test_empty_store_500_candles_three_calls() {
        let (_dir, store) = temp_store();
        let plan = ChunkOptimizer::new(200).plan(&store, &key(), &requested(0, 500)).unwrap();

        assert_eq!(fetch_sizes(&plan), vec![200, 200, 100]);
        assert_eq!(plan.local_count(Timeframe::Minute1), 0);

        let chunks: Vec<_> = plan.fetch_chunks().collect();
        assert_eq!(chunks[0].range.start, at_minute(0));
        assert_eq!(chunks[0].next_anchor, at_minute(200));
        assert_eq!(chunks[0].remaining_count, 300);
        assert_eq!(chunks[2].range.end, at_minute(499));
        assert_eq!(chunks[2].remaining_count, 0);
        assert!(chunks.iter().all(|c| c.kind == FetchKind::Full));
    }

    #[test]
    fn test_fully_cached_plan_is_local_only() {
        let (_dir, store) = temp_store();
        seed(&store, 0, 400);
        let plan = ChunkOptimizer::new(200).plan(&store, &key(), &requested(0, 400)).unwrap();
        assert!(plan.is_local_only());
        assert_eq!(plan.local_count(Timeframe::Minute1), 400);
    }

    #[test]
    fn test_cached_prefix_fetches_only_the_newest_200() {
        let (_dir, store) = temp_store();
        seed(&store, 0, 100);
        let plan = ChunkOptimizer::new(200).plan(&store, &key(), &requested(0, 300)).unwrap();

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(
            plan.steps[0],
            PlanStep::Local(TimeRange::for_timeframe(at_minute(0), at_minute(99), Timeframe::Minute1))
        );
        let fetch: Vec<_> = plan.fetch_chunks().collect();
        assert_eq!(fetch.len(), 1);
        assert_eq!(fetch[0].range.start, at_minute(100));
        assert_eq!(fetch[0].range.end, at_minute(299));
        assert_eq!(fetch[0].requested_count, 200);
    }

    #[test]
    fn test_late_cached_run_fetches_prefix_only() {
        let (_dir, store) = temp_store();
        seed(&store, 50, 150);
        let plan = ChunkOptimizer::new(200).plan(&store, &key(), &requested(0, 200)).unwrap();

        let fetch: Vec<_> = plan.fetch_chunks().collect();
        assert_eq!(fetch.len(), 1);
        assert_eq!(fetch[0].kind, FetchKind::Partial);
        assert_eq!((fetch[0].range.start, fetch[0].range.end), (at_minute(0), at_minute(49)));
        assert_eq!(fetch[0].next_anchor, at_minute(50));
        assert_eq!(plan.local_count(Timeframe::Minute1), 150);
    }

    #[test]
    fn test_fragmented_window_is_one_full_fetch() {
        let (_dir, store) = temp_store();
        seed(&store, 0, 20);
        seed(&store, 30, 20);
        seed(&store, 60, 20);
        let plan = ChunkOptimizer::new(200).plan(&store, &key(), &requested(0, 100)).unwrap();

        assert_eq!(plan.steps.len(), 1);
        let fetch: Vec<_> = plan.fetch_chunks().collect();
        assert_eq!(fetch[0].kind, FetchKind::Full);
        assert_eq!(fetch[0].requested_count, 100);
    }

    #[test]
    fn test_upstream_to_sits_half_a_step_past_the_range() {
        let (_dir, store) = temp_store();
        let plan = ChunkOptimizer::new(200).plan(&store, &key(), &requested(0, 10)).unwrap();
        let chunk = plan.fetch_chunks().next().unwrap();
        assert_eq!(chunk.upstream_to, at_minute(9) + Duration::seconds(30));
    }

    #[test]
    fn test_plan_covers_request_without_overlap() {
        let (_dir, store) = temp_store();
        seed(&store, 0, 120);
        seed(&store, 150, 10);
        seed(&store, 400, 300);
        let request = requested(0, 800);
        let plan = ChunkOptimizer::new(200).plan(&store, &key(), &request).unwrap();

        let mut cursor = request.start;
        for planned in &plan.steps {
            let range = match planned {
                PlanStep::Local(r) => *r,
                PlanStep::Fetch(c) => c.range,
            };
            assert_eq!(range.start, cursor);
            assert!(range.count(Timeframe::Minute1) <= 200);
            cursor = range.end + step(Timeframe::Minute1);
        }
        assert_eq!(cursor, request.end + step(Timeframe::Minute1));
    }

    #[test]
    fn test_misaligned_row_stalls_planning() {
        let (_dir, store) = temp_store();
        // off-boundary row that never passed validation
        let stray = candle(SYMBOL, Timeframe::Minute1, at_minute(0) + Duration::seconds(30));
        store.upsert_batch(&key(), &[stray]).unwrap();

        let err = ChunkOptimizer::new(200).plan(&store, &key(), &requested(0, 10)).unwrap_err();
        assert!(matches!(err, SyncError::PlanningStalled { .. }));
    }
}
