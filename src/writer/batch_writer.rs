//! Batch Writer
//!
//! Queues write jobs by priority and commits them to the store from a
//! background flush loop. A flush cycle drains every queue and commits one
//! priority tier at a time: within a tier the jobs are grouped by series and
//! the groups commit concurrently, each group's jobs in submission order.

use super::job::{CompletionReceiver, WriteJob, WritePriority, WriteReceipt};
use super::queue::PriorityQueues;
use super::{PriorityDepth, QueueStatus};
use crate::config::WriterConfig;
use crate::db::CandleStore;
use crate::error::{Result, SyncError};
use crate::models::{CandleRecord, SeriesKey};
use crate::scheduler::MaintenanceStatus;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome counts of one flush cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub jobs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rows_written: usize,
}

impl std::ops::AddAssign for FlushSummary {
    fn add_assign(&mut self, other: FlushSummary) {
        self.jobs += other.jobs;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.rows_written += other.rows_written;
    }
}

struct WriterInner {
    store: Arc<CandleStore>,
    config: WriterConfig,
    queues: Mutex<PriorityQueues>,
    flush_now: Notify,
    stop: Notify,
    closed: AtomicBool,
    /// One flush cycle at a time
    flush_lock: tokio::sync::Mutex<()>,
    commit_permits: Semaphore,
    commit_seq: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    rows_written: AtomicU64,
    last_flush: RwLock<Option<DateTime<Utc>>>,
}

/// Priority-queued, batched writer in front of [`CandleStore`]
pub struct BatchWriter {
    inner: Arc<WriterInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchWriter {
    /// Build a writer without starting its flush loop
    pub fn new(store: Arc<CandleStore>, config: WriterConfig) -> Self {
        let permits = config.max_concurrent_commits.max(1);
        Self {
            inner: Arc::new(WriterInner {
                store,
                config,
                queues: Mutex::new(PriorityQueues::new()),
                flush_now: Notify::new(),
                stop: Notify::new(),
                closed: AtomicBool::new(false),
                flush_lock: tokio::sync::Mutex::new(()),
                commit_permits: Semaphore::new(permits),
                commit_seq: AtomicU64::new(0),
                jobs_succeeded: AtomicU64::new(0),
                jobs_failed: AtomicU64::new(0),
                rows_written: AtomicU64::new(0),
                last_flush: RwLock::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the background flush loop. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move {
            run_flush_loop(inner).await;
        }));
        info!(
            "Batch writer started (interval {}s, {} concurrent commits)",
            self.inner.config.flush_interval_secs, self.inner.config.max_concurrent_commits
        );
    }

    /// Queue records for one series.
    ///
    /// Critical jobs and queues over the size threshold wake the flush loop
    /// immediately. When the total depth is at the cap, a flush runs inline
    /// before the job is accepted.
    pub async fn submit(
        &self,
        key: SeriesKey,
        records: Vec<CandleRecord>,
        priority: WritePriority,
    ) -> Result<(Uuid, CompletionReceiver)> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::WriterClosed("writer is shutting down".into()));
        }

        let depth = self.inner.queues.lock().total_depth();
        if depth >= self.inner.config.max_queue_depth {
            warn!(
                "Write queue depth {} reached cap {}, flushing before accepting {}",
                depth, self.inner.config.max_queue_depth, key
            );
            flush_cycle(&self.inner).await;
        }

        let (job, receiver) = WriteJob::new(key, records, priority);
        let job_id = job.id;
        debug!("Queued job {} for {} ({} rows, {})", job_id, job.key, job.records.len(), priority);

        let queue_bytes = self.inner.queues.lock().push(job);
        if priority == WritePriority::Critical || queue_bytes > self.inner.config.max_queue_bytes {
            self.inner.flush_now.notify_one();
        }

        Ok((job_id, receiver))
    }

    /// Run one flush cycle now
    pub async fn flush(&self) -> FlushSummary {
        flush_cycle(&self.inner).await
    }

    /// Queue depths, counters and the given maintenance state
    pub fn queue_status(&self, maintenance: MaintenanceStatus) -> QueueStatus {
        let queues = self.inner.queues.lock();
        let per_priority = WritePriority::ALL
            .into_iter()
            .map(|priority| PriorityDepth {
                priority,
                depth: queues.depth(priority),
                estimated_bytes: queues.bytes(priority),
            })
            .collect();

        QueueStatus {
            queues: per_priority,
            total_depth: queues.total_depth(),
            estimated_bytes: queues.total_bytes(),
            jobs_succeeded: self.inner.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.inner.jobs_failed.load(Ordering::Relaxed),
            rows_written: self.inner.rows_written.load(Ordering::Relaxed),
            last_flush: *self.inner.last_flush.read(),
            maintenance,
        }
    }

    /// Stop accepting jobs, stop the loop and commit whatever is still queued
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop.notify_one();

        let task = self.task.lock().take();
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                error!("Batch writer loop ended abnormally: {}", e);
            }
        }

        let summary = flush_cycle(&self.inner).await;
        info!("Batch writer stopped ({} jobs drained on shutdown)", summary.jobs);
    }
}

async fn run_flush_loop(inner: Arc<WriterInner>) {
    let mut ticker = tokio::time::interval(inner.config.flush_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = inner.flush_now.notified() => {}
            _ = inner.stop.notified() => break,
        }
        flush_cycle(&inner).await;
    }

    flush_cycle(&inner).await;
    debug!("Batch writer loop exited");
}

/// Drain all queues and commit everything drained
async fn flush_cycle(inner: &Arc<WriterInner>) -> FlushSummary {
    let _cycle = inner.flush_lock.lock().await;

    let jobs = inner.queues.lock().drain_all();
    if jobs.is_empty() {
        return FlushSummary::default();
    }
    let job_count = jobs.len();
    debug!("Flushing {} job(s)", job_count);

    let mut tiers: [Vec<WriteJob>; 4] = Default::default();
    for job in jobs {
        tiers[job.priority.index()].push(job);
    }

    // a tier starts only after every commit of the tier above has finished
    let mut total = FlushSummary::default();
    for tier in tiers {
        if tier.is_empty() {
            continue;
        }
        total += commit_tier(inner, tier).await;
    }

    *inner.last_flush.write() = Some(Utc::now());
    if total.failed > 0 {
        warn!(
            "Flush finished: {} committed, {} failed, {} rows",
            total.succeeded, total.failed, total.rows_written
        );
    } else {
        debug!("Flush finished: {} committed, {} rows", total.succeeded, total.rows_written);
    }
    total
}

/// Commit the jobs of one priority, one concurrent group per series
async fn commit_tier(inner: &Arc<WriterInner>, jobs: Vec<WriteJob>) -> FlushSummary {
    let mut groups: Vec<(SeriesKey, Vec<WriteJob>)> = Vec::new();
    let mut index: HashMap<SeriesKey, usize> = HashMap::new();
    for job in jobs {
        match index.get(&job.key) {
            Some(&i) => groups[i].1.push(job),
            None => {
                index.insert(job.key.clone(), groups.len());
                groups.push((job.key.clone(), vec![job]));
            }
        }
    }

    let commits = groups.into_iter().map(|(key, group)| {
        let inner = inner.clone();
        async move {
            let _permit = match inner.commit_permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    fail_group(&inner, group, "commit semaphore closed");
                    return FlushSummary::default();
                }
            };
            let worker = inner.clone();
            let series = key.to_string();
            match tokio::task::spawn_blocking(move || commit_group(&worker, group)).await {
                Ok(summary) => summary,
                Err(e) => {
                    error!("Commit task for {} panicked: {}", series, e);
                    FlushSummary::default()
                }
            }
        }
    });

    let mut total = FlushSummary::default();
    for summary in join_all(commits).await {
        total += summary;
    }
    total
}

/// Commit one series' jobs in order. A failing job resolves as failed and the
/// next job still runs.
fn commit_group(inner: &WriterInner, jobs: Vec<WriteJob>) -> FlushSummary {
    let mut summary = FlushSummary::default();
    let batch_rows = inner.config.batch_rows.max(1);

    for job in jobs {
        summary.jobs += 1;
        let mut written = 0usize;
        let mut failure = None;

        for batch in job.records.chunks(batch_rows) {
            match inner.store.upsert_batch(&job.key, batch) {
                Ok(rows) => written += rows,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            None => {
                let commit_seq = inner.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
                inner.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
                inner.rows_written.fetch_add(written as u64, Ordering::Relaxed);
                summary.succeeded += 1;
                summary.rows_written += written;
                let receipt = WriteReceipt {
                    job_id: job.id,
                    rows_written: written,
                    committed_at: Utc::now(),
                    commit_seq,
                };
                job.resolve(Ok(receipt));
            }
            Some(e) => {
                error!(
                    "Write job {} for {} failed ({} rows, {} committed before failure): {}",
                    job.id,
                    job.key,
                    job.records.len(),
                    written,
                    e
                );
                inner.jobs_failed.fetch_add(1, Ordering::Relaxed);
                inner.rows_written.fetch_add(written as u64, Ordering::Relaxed);
                summary.failed += 1;
                summary.rows_written += written;
                job.resolve(Err(e));
            }
        }
    }

    summary
}

fn fail_group(inner: &WriterInner, jobs: Vec<WriteJob>, reason: &str) {
    for job in jobs {
        error!("Write job {} for {} dropped: {}", job.id, job.key, reason);
        inner.jobs_failed.fetch_add(1, Ordering::Relaxed);
        job.resolve(Err(SyncError::WriterClosed(reason.to_string())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TimeRange, Timeframe};
    use crate::test_support::{at_minute, synthetic_series, temp_store};
    use crate::writer::wait_for;
    use std::time::Duration;

    fn key(symbol: &str) -> SeriesKey {
        SeriesKey::new(symbol, Timeframe::Minute1)
    }

    fn rows(symbol: &str, first: i64, count: i64) -> Vec<CandleRecord> {
        synthetic_series(symbol, Timeframe::Minute1, at_minute(first), count)
    }

    fn config() -> WriterConfig {
        WriterConfig {
            batch_rows: 50,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_critical_commits_before_normal_and_low() {
        let (_dir, store) = temp_store();
        let writer = BatchWriter::new(store, config());

        let (_, low) = writer.submit(key("BTC-USDT"), rows("BTC-USDT", 0, 10), WritePriority::Low).await.unwrap();
        let (_, normal) = writer.submit(key("BTC-USDT"), rows("BTC-USDT", 10, 10), WritePriority::Normal).await.unwrap();
        let (_, critical) = writer.submit(key("BTC-USDT"), rows("BTC-USDT", 20, 10), WritePriority::Critical).await.unwrap();

        let summary = writer.flush().await;
        assert_eq!(summary.succeeded, 3);

        let critical = wait_for(critical).await.unwrap();
        let normal = wait_for(normal).await.unwrap();
        let low = wait_for(low).await.unwrap();
        assert!(critical.commit_seq < normal.commit_seq);
        assert!(normal.commit_seq < low.commit_seq);
        assert!(critical.committed_at <= normal.committed_at);
        assert!(normal.committed_at <= low.committed_at);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_priority_order_holds_across_series() {
        let (_dir, store) = temp_store();
        let writer = BatchWriter::new(store, config());

        let (_, low) = writer.submit(key("ETH-USDT"), rows("ETH-USDT", 0, 1), WritePriority::Low).await.unwrap();
        let (_, normal) = writer.submit(key("SOL-USDT"), rows("SOL-USDT", 0, 1), WritePriority::Normal).await.unwrap();
        let (_, critical) = writer
            .submit(key("BTC-USDT"), rows("BTC-USDT", 0, 2_000), WritePriority::Critical)
            .await
            .unwrap();

        writer.flush().await;
        let critical = wait_for(critical).await.unwrap();
        let normal = wait_for(normal).await.unwrap();
        let low = wait_for(low).await.unwrap();
        assert!(critical.commit_seq < normal.commit_seq);
        assert!(normal.commit_seq < low.commit_seq);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_writes_to_new_series_commit_together() {
        let (_dir, store) = temp_store();
        let writer = BatchWriter::new(store.clone(), config());
        let symbols = ["BTC-USDT", "ETH-USDT", "SOL-USDT", "XRP-USDT", "ADA-USDT", "DOT-USDT"];

        let mut receivers = Vec::new();
        for symbol in symbols {
            let (_, rx) = writer
                .submit(key(symbol), rows(symbol, 0, 200), WritePriority::Critical)
                .await
                .unwrap();
            receivers.push(rx);
        }

        let summary = writer.flush().await;
        assert_eq!((summary.succeeded, summary.failed), (6, 0));
        for rx in receivers {
            assert_eq!(wait_for(rx).await.unwrap().rows_written, 200);
        }
        assert_eq!(store.list_series().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_large_job_is_split_into_batches() {
        let (_dir, store) = temp_store();
        let writer = BatchWriter::new(store.clone(), config());
        let (_, rx) = writer.submit(key("BTC-USDT"), rows("BTC-USDT", 0, 175), WritePriority::High).await.unwrap();

        writer.flush().await;
        assert_eq!(wait_for(rx).await.unwrap().rows_written, 175);
        let range = TimeRange::from_start(at_minute(0), 175, Timeframe::Minute1);
        assert_eq!(store.count_in_range(&key("BTC-USDT"), &range).unwrap(), 175);
    }

    #[tokio::test]
    async fn test_failed_job_leaves_siblings_untouched() {
        let (_dir, store) = temp_store();
        let writer = BatchWriter::new(store.clone(), config());

        let mut broken = rows("BTC-USDT", 0, 10);
        broken[3].open = f64::NAN;
        let (_, bad) = writer.submit(key("BTC-USDT"), broken, WritePriority::Critical).await.unwrap();
        let (_, same_series) = writer.submit(key("BTC-USDT"), rows("BTC-USDT", 100, 10), WritePriority::Normal).await.unwrap();
        let (_, other_series) = writer.submit(key("ETH-USDT"), rows("ETH-USDT", 0, 10), WritePriority::Normal).await.unwrap();

        let summary = writer.flush().await;
        assert_eq!((summary.succeeded, summary.failed), (2, 1));

        assert!(matches!(wait_for(bad).await, Err(SyncError::StoreWrite { rows: 10, .. })));
        assert_eq!(wait_for(same_series).await.unwrap().rows_written, 10);
        assert_eq!(wait_for(other_series).await.unwrap().rows_written, 10);

        let status = writer.queue_status(MaintenanceStatus::default());
        assert_eq!(status.jobs_failed, 1);
        assert_eq!(status.jobs_succeeded, 2);
        assert_eq!(status.rows_written, 20);
        assert!(status.last_flush.is_some());
    }

    #[tokio::test]
    async fn test_queue_status_reports_depths() {
        let (_dir, store) = temp_store();
        let writer = BatchWriter::new(store, config());
        writer.submit(key("BTC-USDT"), rows("BTC-USDT", 0, 5), WritePriority::Low).await.unwrap();
        writer.submit(key("BTC-USDT"), rows("BTC-USDT", 5, 5), WritePriority::Low).await.unwrap();
        writer.submit(key("BTC-USDT"), rows("BTC-USDT", 10, 5), WritePriority::High).await.unwrap();

        let status = writer.queue_status(MaintenanceStatus::default());
        assert_eq!(status.total_depth, 3);
        let low = status.queues.iter().find(|q| q.priority == WritePriority::Low).unwrap();
        assert_eq!(low.depth, 2);
        assert!(status.estimated_bytes > 0);
    }

    #[tokio::test]
    async fn test_depth_cap_flushes_before_accepting() {
        let (_dir, store) = temp_store();
        let writer = BatchWriter::new(
            store,
            WriterConfig {
                max_queue_depth: 2,
                ..config()
            },
        );
        let (_, first) = writer.submit(key("BTC-USDT"), rows("BTC-USDT", 0, 5), WritePriority::Low).await.unwrap();
        writer.submit(key("BTC-USDT"), rows("BTC-USDT", 5, 5), WritePriority::Low).await.unwrap();
        // third submission hits the cap and drains the first two inline
        writer.submit(key("BTC-USDT"), rows("BTC-USDT", 10, 5), WritePriority::Low).await.unwrap();

        assert!(wait_for(first).await.is_ok());
        assert_eq!(writer.queue_status(MaintenanceStatus::default()).total_depth, 1);
    }

    #[tokio::test]
    async fn test_critical_job_wakes_running_loop() {
        let (_dir, store) = temp_store();
        let writer = BatchWriter::new(
            store,
            WriterConfig {
                flush_interval_secs: 3_600,
                ..config()
            },
        );
        writer.start();

        let (_, rx) = writer.submit(key("BTC-USDT"), rows("BTC-USDT", 0, 5), WritePriority::Critical).await.unwrap();
        let receipt = tokio::time::timeout(Duration::from_secs(5), wait_for(rx))
            .await
            .expect("critical job should not wait for the interval")
            .unwrap();
        assert_eq!(receipt.rows_written, 5);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects_new_jobs() {
        let (_dir, store) = temp_store();
        let writer = BatchWriter::new(store, config());
        writer.start();

        let (_, rx) = writer.submit(key("BTC-USDT"), rows("BTC-USDT", 0, 5), WritePriority::Low).await.unwrap();
        writer.shutdown().await;

        assert_eq!(wait_for(rx).await.unwrap().rows_written, 5);
        assert!(matches!(
            writer.submit(key("BTC-USDT"), rows("BTC-USDT", 5, 5), WritePriority::Low).await,
            Err(SyncError::WriterClosed(_))
        ));
    }
}
