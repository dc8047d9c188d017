//! Candle Sync Service
//!
//! Entry point for candle requests. Normalizes the request, plans it against
//! the store, fetches only the missing spans from upstream, routes fetched
//! candles through the batch writer and returns the assembled series.

use super::chunk_optimizer::{ChunkOptimizer, FetchChunk, FetchPlan};
use super::overlap_analyzer::{OverlapAnalyzer, OverlapResult, OverlapStatus};
use crate::config::EngineConfig;
use crate::db::{CandleStore, NewSyncLog, SeriesSummary, SyncLogEntry};
use crate::error::{Result, SyncError};
use crate::models::{step, CandleRecord, SeriesKey, TimeRange, Timeframe};
use crate::scheduler::{MaintenanceScheduler, MaintenanceStatus};
use crate::time_utils::{epoch_seconds, normalize};
use crate::upstream::{fetch_with_retry, CandleFetcher, DispatchThrottle, RetryPolicy};
use crate::writer::{wait_for, BatchWriter, QueueStatus, WritePriority, WriteReceipt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Candle request; see [`normalize`] for the accepted parameter combinations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl CandleRequest {
    pub fn latest(symbol: impl Into<String>, timeframe: Timeframe, count: i64) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            count: Some(count),
            start: None,
            end: None,
        }
    }

    pub fn between(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            count: None,
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.timeframe)
    }
}

/// Cooperative cancellation flag, checked between chunk dispatches
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sub-range the request could not resolve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRange {
    pub range: TimeRange,
    pub reason: String,
}

/// Assembled result of one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub range: TimeRange,
    /// Ascending by open time
    pub candles: Vec<CandleRecord>,
    pub status: OverlapStatus,
    pub estimated_calls: usize,
    pub upstream_calls: usize,
    pub served_from_store: i64,
    pub failed_ranges: Vec<FailedRange>,
    pub cancelled: bool,
}

impl SyncOutcome {
    /// True when some part of the requested range is missing from the result
    pub fn is_partial(&self) -> bool {
        self.cancelled || !self.failed_ranges.is_empty()
    }
}

/// What a dispatched chunk task reports back
struct ChunkOutcome {
    range: TimeRange,
    fetched: Vec<CandleRecord>,
    /// Slots of `range` the upstream response did not cover
    uncovered: Vec<TimeRange>,
    fetch_error: Option<SyncError>,
    commit: Option<Result<WriteReceipt>>,
}

/// State shared with dispatched chunk tasks
#[derive(Clone)]
struct ChunkContext {
    fetcher: Arc<dyn CandleFetcher>,
    writer: Arc<BatchWriter>,
    throttle: Arc<DispatchThrottle>,
    retry: RetryPolicy,
}

pub struct CandleSyncService {
    store: Arc<CandleStore>,
    writer: Arc<BatchWriter>,
    fetcher: Arc<dyn CandleFetcher>,
    throttle: Arc<DispatchThrottle>,
    retry: RetryPolicy,
    analyzer: OverlapAnalyzer,
    optimizer: ChunkOptimizer,
    max_request_count: i64,
    maintenance: Option<Arc<MaintenanceScheduler>>,
}

impl CandleSyncService {
    pub fn new(
        store: Arc<CandleStore>,
        writer: Arc<BatchWriter>,
        fetcher: Arc<dyn CandleFetcher>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            writer,
            fetcher,
            throttle: Arc::new(DispatchThrottle::new(config.upstream.min_spacing())),
            retry: RetryPolicy::from(&config.upstream),
            analyzer: OverlapAnalyzer::new(config.upstream.max_per_call),
            optimizer: ChunkOptimizer::new(config.upstream.max_per_call),
            max_request_count: config.sync.max_request_count,
            maintenance: None,
        }
    }

    /// Report this scheduler's state in [`get_queue_status`](Self::get_queue_status)
    pub fn with_maintenance(mut self, scheduler: Arc<MaintenanceScheduler>) -> Self {
        self.maintenance = Some(scheduler);
        self
    }

    /// Resolve a request into its canonical aligned range
    pub fn resolve_range(&self, request: &CandleRequest) -> Result<TimeRange> {
        if request.symbol.trim().is_empty() {
            return Err(SyncError::InvalidRange("symbol is required".into()));
        }
        normalize(
            request.count,
            request.start,
            request.end,
            request.timeframe,
            Utc::now(),
            self.max_request_count,
        )
    }

    /// Classify and plan a request without fetching anything
    pub async fn plan(&self, request: &CandleRequest) -> Result<(TimeRange, OverlapResult, FetchPlan)> {
        let range = self.resolve_range(request)?;
        let key = request.series_key();
        let store = self.store.clone();
        let analyzer = self.analyzer;
        let optimizer = self.optimizer;

        let (overlap, plan) = tokio::task::spawn_blocking(move || -> Result<_> {
            let overlap = analyzer.analyze(&store, &key, &range)?;
            let plan = optimizer.plan(&store, &key, &range)?;
            Ok((overlap, plan))
        })
        .await??;

        Ok((range, overlap, plan))
    }

    pub async fn get_candles(&self, request: CandleRequest) -> Result<SyncOutcome> {
        self.get_candles_cancellable(request, &CancelHandle::new()).await
    }

    /// Serve a request, fetching what the store lacks.
    ///
    /// Cancellation stops further dispatches; chunks already dispatched still
    /// fetch and commit. When some chunks fail, the resolved part is returned
    /// with the failed sub-ranges listed. An error is returned only when
    /// nothing at all could be resolved.
    pub async fn get_candles_cancellable(
        &self,
        request: CandleRequest,
        cancel: &CancelHandle,
    ) -> Result<SyncOutcome> {
        let key = request.series_key();
        let (range, overlap, plan) = self.plan(&request).await?;

        info!(
            "Sync {} {}: {} (estimated {} call(s), planned {})",
            key,
            range,
            overlap.status,
            overlap.estimated_calls,
            plan.upstream_calls()
        );

        let mut handles: Vec<(TimeRange, JoinHandle<ChunkOutcome>)> = Vec::new();
        let mut failed_ranges = Vec::new();
        let mut cancelled = false;
        let context = ChunkContext {
            fetcher: self.fetcher.clone(),
            writer: self.writer.clone(),
            throttle: self.throttle.clone(),
            retry: self.retry,
        };

        for chunk in plan.fetch_chunks() {
            if !cancelled {
                self.throttle.acquire().await;
                cancelled = cancel.is_cancelled();
            }
            if cancelled {
                failed_ranges.push(FailedRange {
                    range: chunk.range,
                    reason: "cancelled".to_string(),
                });
                continue;
            }
            debug!("Dispatching {} {} ({} candles)", key, chunk.range, chunk.requested_count);
            handles.push((chunk.range, tokio::spawn(run_chunk(context.clone(), chunk.clone()))));
        }
        let upstream_calls = handles.len();

        let mut uncommitted: Vec<CandleRecord> = Vec::new();
        let mut first_error: Option<SyncError> = None;
        for (chunk_range, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Chunk task for {} {} failed to complete: {}", key, chunk_range, e);
                    let err = SyncError::from(e);
                    failed_ranges.push(FailedRange {
                        range: chunk_range,
                        reason: err.to_string(),
                    });
                    first_error.get_or_insert(err);
                    continue;
                }
            };
            for span in &outcome.uncovered {
                warn!("Upstream returned no candles for {} {}", key, span);
                failed_ranges.push(FailedRange {
                    range: *span,
                    reason: "upstream returned no data".to_string(),
                });
            }
            if let Some(err) = outcome.fetch_error {
                warn!("Chunk {} for {} failed: {}", outcome.range, key, err);
                failed_ranges.push(FailedRange {
                    range: outcome.range,
                    reason: err.to_string(),
                });
                first_error.get_or_insert(err);
                continue;
            }
            if let Some(Err(err)) = outcome.commit {
                warn!(
                    "Fetched {} candles for {} {} but the commit failed: {}",
                    outcome.fetched.len(),
                    key,
                    outcome.range,
                    err
                );
                uncommitted.extend(outcome.fetched);
            }
        }

        let store = self.store.clone();
        let read_key = key.clone();
        let stored = tokio::task::spawn_blocking(move || store.get_candles(&read_key, &range)).await??;
        let candles = merge_candles(stored, uncommitted);

        let outcome = SyncOutcome {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            range,
            candles,
            status: overlap.status,
            estimated_calls: overlap.estimated_calls,
            upstream_calls,
            served_from_store: plan.local_count(key.timeframe),
            failed_ranges,
            cancelled,
        };

        self.record_sync(&outcome).await;

        if outcome.candles.is_empty() && !outcome.cancelled {
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        info!(
            "Sync {} done: {} candles ({} from store, {} upstream call(s){})",
            key,
            outcome.candles.len(),
            outcome.served_from_store,
            outcome.upstream_calls,
            if outcome.is_partial() { ", partial" } else { "" }
        );
        Ok(outcome)
    }

    /// Validate and queue records for background write; returns the job id
    pub async fn enqueue_upsert(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        records: Vec<CandleRecord>,
        priority: WritePriority,
    ) -> Result<Uuid> {
        let key = SeriesKey::new(symbol, timeframe);
        for record in &records {
            if record.symbol != key.symbol || record.timeframe != key.timeframe {
                return Err(SyncError::Validation(format!(
                    "record for {} does not belong to {}",
                    record.series_key(),
                    key
                )));
            }
            record.validate()?;
        }

        let (job_id, receiver) = self.writer.submit(key, records, priority).await?;
        tokio::spawn(async move {
            if let Err(e) = wait_for(receiver).await {
                warn!("Upsert job {} failed: {}", job_id, e);
            }
        });
        Ok(job_id)
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let maintenance = self
            .maintenance
            .as_ref()
            .map(|m| m.status())
            .unwrap_or_else(MaintenanceStatus::default);
        self.writer.queue_status(maintenance)
    }

    pub async fn list_series(&self) -> Result<Vec<SeriesSummary>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.list_series()).await?
    }

    pub async fn recent_sync_log(&self, limit: i64) -> Result<Vec<SyncLogEntry>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.recent_sync_log(limit)).await?
    }

    async fn record_sync(&self, outcome: &SyncOutcome) {
        let failed_ranges = if outcome.failed_ranges.is_empty() {
            None
        } else {
            serde_json::to_string(&outcome.failed_ranges).ok()
        };
        let store = self.store.clone();
        let symbol = outcome.symbol.clone();
        let timeframe = outcome.timeframe;
        let range = outcome.range;
        let status = outcome.status;
        let upstream_calls = outcome.upstream_calls as i64;
        let served_from_store = outcome.served_from_store;
        let cancelled = outcome.cancelled;

        let result = tokio::task::spawn_blocking(move || {
            store.record_sync(&NewSyncLog {
                symbol: &symbol,
                timeframe: timeframe.as_str(),
                range_start: range.start,
                range_end: range.end,
                status: status.as_str(),
                upstream_calls,
                served_from_store,
                failed_ranges,
                cancelled,
            })
        })
        .await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to record sync log: {}", e),
            Err(e) => warn!("Sync log task failed: {}", e),
        }
    }
}

/// Fetch one chunk, keep the valid candles inside its range and commit them.
/// Runs detached from the caller, so it completes even if the request is dropped.
async fn run_chunk(context: ChunkContext, chunk: FetchChunk) -> ChunkOutcome {
    let key = chunk.series_key();
    let fetched = fetch_with_retry(
        context.fetcher.as_ref(),
        &context.retry,
        &context.throttle,
        &chunk.symbol,
        chunk.timeframe,
        chunk.upstream_to,
        chunk.requested_count,
    )
    .await;

    let raw = match fetched {
        Ok(raw) => raw,
        Err(e) => {
            return ChunkOutcome {
                range: chunk.range,
                fetched: Vec::new(),
                uncovered: Vec::new(),
                fetch_error: Some(e),
                commit: None,
            }
        }
    };

    let records = accept_records(&key, &chunk.range, raw);
    let uncovered = uncovered_spans(&chunk.range, &records, chunk.timeframe);
    if records.is_empty() {
        return ChunkOutcome {
            range: chunk.range,
            fetched: records,
            uncovered,
            fetch_error: None,
            commit: None,
        };
    }

    let commit = match context
        .writer
        .submit(key, records.clone(), WritePriority::Critical)
        .await
    {
        Ok((_, receiver)) => wait_for(receiver).await,
        Err(e) => Err(e),
    };

    ChunkOutcome {
        range: chunk.range,
        fetched: records,
        uncovered,
        fetch_error: None,
        commit: Some(commit),
    }
}

/// Valid candles of `key` inside `range`, ascending, one per open time
fn accept_records(key: &SeriesKey, range: &TimeRange, raw: Vec<CandleRecord>) -> Vec<CandleRecord> {
    let received = raw.len();
    let mut accepted: BTreeMap<i64, CandleRecord> = BTreeMap::new();
    for record in raw {
        if record.symbol != key.symbol || record.timeframe != key.timeframe {
            warn!("Dropping upstream candle for {} in a {} response", record.series_key(), key);
            continue;
        }
        if !range.contains(record.open_time) {
            continue;
        }
        if let Err(e) = record.validate() {
            warn!("Dropping invalid upstream candle: {}", e);
            continue;
        }
        accepted.insert(epoch_seconds(record.open_time), record);
    }
    if accepted.len() < received {
        debug!("Kept {} of {} upstream candles for {} {}", accepted.len(), received, key, range);
    }
    accepted.into_values().collect()
}

/// Runs of slots in `range` with no record; `records` must be ascending and unique
fn uncovered_spans(range: &TimeRange, records: &[CandleRecord], timeframe: Timeframe) -> Vec<TimeRange> {
    let mut spans = Vec::new();
    let mut next = range.start;
    for record in records {
        if record.open_time > next {
            spans.push(TimeRange::for_timeframe(next, record.open_time - step(timeframe), timeframe));
        }
        next = record.open_time + step(timeframe);
    }
    if next <= range.end {
        spans.push(TimeRange::for_timeframe(next, range.end, timeframe));
    }
    spans
}

/// Stored candles plus fetched ones that never made it into the store
fn merge_candles(stored: Vec<CandleRecord>, uncommitted: Vec<CandleRecord>) -> Vec<CandleRecord> {
    if uncommitted.is_empty() {
        return stored;
    }
    let mut merged: BTreeMap<i64, CandleRecord> = stored
        .into_iter()
        .map(|c| (epoch_seconds(c.open_time), c))
        .collect();
    for candle in uncommitted {
        merged.entry(epoch_seconds(candle.open_time)).or_insert(candle);
    }
    merged.into_values().collect()
}
