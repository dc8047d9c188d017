//! SQLite candle store
//!
//! One physical table per (symbol, timeframe), keyed by open time, behind an
//! r2d2 pool. Reads take any pooled connection; each batch write is one
//! transaction.

pub mod models;
mod candles;
mod connection;
mod maintenance;
mod migrations;
mod registry;
mod sync_log;

use crate::config::StoreConfig;
use crate::error::{Result, SyncError};
use crate::models::{step, CandleRecord, SeriesKey, TimeRange, Timeframe};
use chrono::{DateTime, Utc};
pub use connection::DbPool;
use models::*;
use registry::SeriesRegistry;
use rusqlite::TransactionBehavior;
pub use sync_log::NewSyncLog;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local persistent candle store
pub struct CandleStore {
    pool: DbPool,
    registry: SeriesRegistry,
    path: PathBuf,
}

impl CandleStore {
    /// Open (or create) the store and bring its bookkeeping tables up to date
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let pool = connection::create_pool(config)?;
        {
            let conn = pool.get()?;
            migrations::run_migrations(&conn)?;
        }

        let registry = SeriesRegistry::new(Duration::from_secs(config.registry_refresh_secs));
        let series = registry.load(&*pool.get()?)?;

        tracing::info!("Candle store opened at {:?} ({} series)", config.db_path, series);
        Ok(Self {
            pool,
            registry,
            path: config.db_path.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Table for a series that has been written at least once
    fn table_for(&self, key: &SeriesKey) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        self.registry.lookup(&conn, key)
    }

    // ========== Range queries ==========

    /// Whether at least one candle is stored inside the range
    pub fn has_any_data_in(&self, key: &SeriesKey, range: &TimeRange) -> Result<bool> {
        let Some(table) = self.table_for(key)? else {
            return Ok(false);
        };
        let conn = self.pool.get()?;
        candles::has_any_data_in(&conn, &table, range)
    }

    /// Exact count match: a range is complete only when every slot is stored
    pub fn is_range_complete(&self, key: &SeriesKey, range: &TimeRange, expected: i64) -> Result<bool> {
        Ok(self.count_in_range(key, range)? == expected)
    }

    pub fn count_in_range(&self, key: &SeriesKey, range: &TimeRange) -> Result<i64> {
        let Some(table) = self.table_for(key)? else {
            return Ok(0);
        };
        let conn = self.pool.get()?;
        candles::count_in_range(&conn, &table, range)
    }

    /// Holes between stored candles inside the range, oldest first.
    /// Slots before the first or after the last stored candle are not gaps.
    pub fn find_gaps(&self, key: &SeriesKey, range: &TimeRange) -> Result<Vec<TimeRange>> {
        let Some(table) = self.table_for(key)? else {
            return Ok(Vec::new());
        };
        let conn = self.pool.get()?;
        candles::find_gaps(&conn, &table, range, key.timeframe)
    }

    /// Last open time of the contiguous run starting at the earliest stored
    /// candle in the range, or None when the range holds nothing
    pub fn find_last_continuous_boundary(
        &self,
        key: &SeriesKey,
        range: &TimeRange,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(table) = self.table_for(key)? else {
            return Ok(None);
        };
        let conn = self.pool.get()?;
        let Some(bounds) = candles::range_bounds(&conn, &table, range)? else {
            return Ok(None);
        };
        let gaps = candles::find_gaps(&conn, &table, range, key.timeframe)?;
        Ok(Some(
            gaps.first()
                .map(|gap| gap.start - step(key.timeframe))
                .unwrap_or(bounds.max),
        ))
    }

    /// Earliest and latest stored open times inside the range
    pub fn get_range_bounds(&self, key: &SeriesKey, range: &TimeRange) -> Result<Option<RangeBounds>> {
        let Some(table) = self.table_for(key)? else {
            return Ok(None);
        };
        let conn = self.pool.get()?;
        candles::range_bounds(&conn, &table, range)
    }

    /// Stored candles inside the range, ascending by open time
    pub fn get_candles(&self, key: &SeriesKey, range: &TimeRange) -> Result<Vec<CandleRecord>> {
        let Some(table) = self.table_for(key)? else {
            return Ok(Vec::new());
        };
        let conn = self.pool.get()?;
        candles::select_range(&conn, &table, key, range)
    }

    // ========== Writes ==========

    /// Upsert one batch in a single transaction. Either every row lands or
    /// none does; on failure the error names the series and row count.
    pub fn upsert_batch(&self, key: &SeriesKey, records: &[CandleRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        if let Some(stray) = records.iter().find(|r| r.symbol != key.symbol || r.timeframe != key.timeframe) {
            return Err(SyncError::Validation(format!(
                "record for {} submitted in a batch for {}",
                stray.series_key(),
                key
            )));
        }

        let mut conn = self.pool.get()?;
        let table = self.registry.resolve_or_create(&mut conn, key)?;

        let store_write = |source: rusqlite::Error| SyncError::StoreWrite {
            series: key.to_string(),
            rows: records.len(),
            source,
        };

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_write)?;
        let written = candles::upsert(&tx, &table, records).map_err(store_write)?;
        tx.commit().map_err(store_write)?;

        tracing::debug!("Upserted {} candles into {}", written, table);
        Ok(written)
    }

    // ========== Catalog ==========

    /// Every registered series with its stored bounds
    pub fn list_series(&self) -> Result<Vec<SeriesSummary>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, timeframe, table_name FROM series_registry ORDER BY symbol, timeframe",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut summaries = Vec::with_capacity(entries.len());
        for (symbol, timeframe, table_name) in entries {
            let Ok(timeframe) = timeframe.parse::<Timeframe>() else {
                continue;
            };
            let bounds = candles::table_bounds(&conn, &table_name)?;
            summaries.push(SeriesSummary {
                symbol,
                timeframe,
                first_open_time: bounds.map(|b| b.min),
                last_open_time: bounds.map(|b| b.max),
                row_count: bounds.map(|b| b.count).unwrap_or(0),
                table_name,
            });
        }
        Ok(summaries)
    }

    // ========== Maintenance ==========

    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        let conn = self.pool.get()?;
        Ok(maintenance::checkpoint(&conn)?)
    }

    pub fn refresh_statistics(&self) -> Result<()> {
        let conn = self.pool.get()?;
        Ok(maintenance::refresh_statistics(&conn)?)
    }

    /// Reclaim up to `pages` free pages; returns the free pages remaining
    pub fn compact(&self, pages: u32) -> Result<i64> {
        let conn = self.pool.get()?;
        Ok(maintenance::compact(&conn, pages)?)
    }

    // ========== Sync log ==========

    pub fn record_sync(&self, entry: &NewSyncLog<'_>) -> Result<i64> {
        let conn = self.pool.get()?;
        Ok(sync_log::insert(&conn, entry)?)
    }

    pub fn recent_sync_log(&self, limit: i64) -> Result<Vec<SyncLogEntry>> {
        let conn = self.pool.get()?;
        Ok(sync_log::recent(&conn, limit)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::steps;
    use crate::test_support::{at_minute, synthetic_series, temp_store};

    fn key() -> SeriesKey {
        SeriesKey::new("BTC-USDT", Timeframe::Minute1)
    }

    fn minutes(first: i64, last: i64) -> TimeRange {
        TimeRange::for_timeframe(at_minute(first), at_minute(last), Timeframe::Minute1)
    }

    #[test]
    fn test_unknown_series_reads_empty() {
        let (_dir, store) = temp_store();
        let range = minutes(0, 99);
        assert!(!store.has_any_data_in(&key(), &range).unwrap());
        assert_eq!(store.count_in_range(&key(), &range).unwrap(), 0);
        assert!(store.get_range_bounds(&key(), &range).unwrap().is_none());
        assert!(store.get_candles(&key(), &range).unwrap().is_empty());
        assert!(store.find_last_continuous_boundary(&key(), &range).unwrap().is_none());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let (_dir, store) = temp_store();
        let batch = synthetic_series("BTC-USDT", Timeframe::Minute1, at_minute(0), 50);

        assert_eq!(store.upsert_batch(&key(), &batch).unwrap(), 50);
        assert_eq!(store.upsert_batch(&key(), &batch).unwrap(), 50);

        let range = minutes(0, 49);
        assert_eq!(store.count_in_range(&key(), &range).unwrap(), 50);
        assert!(store.is_range_complete(&key(), &range, 50).unwrap());
        assert_eq!(store.get_candles(&key(), &range).unwrap(), batch);
    }

    #[test]
    fn test_upsert_overwrites_existing_values() {
        let (_dir, store) = temp_store();
        let mut batch = synthetic_series("BTC-USDT", Timeframe::Minute1, at_minute(0), 3);
        store.upsert_batch(&key(), &batch).unwrap();

        batch[1].close = batch[1].high;
        batch[1].sequence = 999;
        store.upsert_batch(&key(), &batch[1..2]).unwrap();

        let stored = store.get_candles(&key(), &minutes(0, 2)).unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[1].sequence, 999);
        assert_eq!(stored[1].close, batch[1].high);
    }

    #[test]
    fn test_single_missing_candle_is_one_step_gap() {
        let (_dir, store) = temp_store();
        let mut batch = synthetic_series("BTC-USDT", Timeframe::Minute1, at_minute(0), 10);
        batch.remove(5);
        store.upsert_batch(&key(), &batch).unwrap();

        let range = minutes(0, 9);
        let gaps = store.find_gaps(&key(), &range).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start, at_minute(5));
        assert_eq!(gaps[0].end, at_minute(5));
        assert_eq!(gaps[0].expected_count, Some(1));

        assert!(!store.is_range_complete(&key(), &range, 10).unwrap());
        assert_eq!(
            store.find_last_continuous_boundary(&key(), &range).unwrap(),
            Some(at_minute(4))
        );
    }

    #[test]
    fn test_edges_are_not_gaps() {
        let (_dir, store) = temp_store();
        let batch = synthetic_series("BTC-USDT", Timeframe::Minute1, at_minute(20), 10);
        store.upsert_batch(&key(), &batch).unwrap();

        let range = minutes(0, 99);
        assert!(store.find_gaps(&key(), &range).unwrap().is_empty());
        let bounds = store.get_range_bounds(&key(), &range).unwrap().unwrap();
        assert_eq!((bounds.min, bounds.max, bounds.count), (at_minute(20), at_minute(29), 10));
        assert_eq!(
            store.find_last_continuous_boundary(&key(), &range).unwrap(),
            Some(at_minute(29))
        );
        assert!(store
            .find_last_continuous_boundary(&key(), &minutes(40, 99))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_concurrent_first_writes_to_new_series() {
        let (_dir, store) = temp_store();
        let handles: Vec<_> = ["BTC-USDT", "ETH-USDT", "SOL-USDT", "XRP-USDT"]
            .into_iter()
            .map(|symbol| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let key = SeriesKey::new(symbol, Timeframe::Minute1);
                    let batch = synthetic_series(symbol, Timeframe::Minute1, at_minute(0), 200);
                    store.upsert_batch(&key, &batch)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 200);
        }
        assert_eq!(store.list_series().unwrap().len(), 4);
    }

    #[test]
    fn test_multiple_gaps_in_order() {
        let (_dir, store) = temp_store();
        let batch: Vec<_> = synthetic_series("BTC-USDT", Timeframe::Minute1, at_minute(0), 30)
            .into_iter()
            .filter(|c| {
                let m = (c.open_time - at_minute(0)).num_minutes();
                !(10..13).contains(&m) && m != 20
            })
            .collect();
        store.upsert_batch(&key(), &batch).unwrap();

        let gaps = store.find_gaps(&key(), &minutes(0, 29)).unwrap();
        assert_eq!(gaps.len(), 2);
        assert_eq!((gaps[0].start, gaps[0].end), (at_minute(10), at_minute(12)));
        assert_eq!(gaps[0].expected_count, Some(3));
        assert_eq!((gaps[1].start, gaps[1].end), (at_minute(20), at_minute(20)));
    }

    #[test]
    fn test_failed_batch_rolls_back_entirely() {
        let (_dir, store) = temp_store();
        let mut batch = synthetic_series("BTC-USDT", Timeframe::Minute1, at_minute(0), 20);
        // NaN binds as NULL and violates NOT NULL on the last row
        batch[19].close = f64::NAN;

        let err = store.upsert_batch(&key(), &batch).unwrap_err();
        match err {
            SyncError::StoreWrite { series, rows, .. } => {
                assert_eq!(series, "BTC-USDT:1m");
                assert_eq!(rows, 20);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.count_in_range(&key(), &minutes(0, 19)).unwrap(), 0);
    }

    #[test]
    fn test_mismatched_record_rejected() {
        let (_dir, store) = temp_store();
        let batch = synthetic_series("ETH-USDT", Timeframe::Minute1, at_minute(0), 2);
        assert!(matches!(
            store.upsert_batch(&key(), &batch),
            Err(SyncError::Validation(_))
        ));
        assert_eq!(store.upsert_batch(&key(), &[]).unwrap(), 0);
    }

    #[test]
    fn test_list_series_reports_bounds() {
        let (_dir, store) = temp_store();
        store
            .upsert_batch(&key(), &synthetic_series("BTC-USDT", Timeframe::Minute1, at_minute(0), 5))
            .unwrap();
        let hourly = SeriesKey::new("ETH-USDT", Timeframe::Hour1);
        store
            .upsert_batch(&hourly, &synthetic_series("ETH-USDT", Timeframe::Hour1, at_minute(0), 3))
            .unwrap();

        let series = store.list_series().unwrap();
        assert_eq!(series.len(), 2);
        let btc = series.iter().find(|s| s.symbol == "BTC-USDT").unwrap();
        assert_eq!(btc.row_count, 5);
        assert_eq!(btc.last_open_time, Some(at_minute(4)));
        let eth = series.iter().find(|s| s.symbol == "ETH-USDT").unwrap();
        assert_eq!(eth.last_open_time, Some(at_minute(0) + steps(Timeframe::Hour1, 2)));
    }

    #[test]
    fn test_maintenance_primitives_run() {
        let (_dir, store) = temp_store();
        store
            .upsert_batch(&key(), &synthetic_series("BTC-USDT", Timeframe::Minute1, at_minute(0), 100))
            .unwrap();

        let stats = store.checkpoint().unwrap();
        assert!(stats.log_frames >= stats.checkpointed_frames);
        store.refresh_statistics().unwrap();
        assert!(store.compact(1000).unwrap() >= 0);
    }

    #[test]
    fn test_sync_log_round_trip() {
        let (_dir, store) = temp_store();
        let entry = NewSyncLog {
            symbol: "BTC-USDT",
            timeframe: "1m",
            range_start: at_minute(0),
            range_end: at_minute(99),
            status: "partial_start",
            upstream_calls: 1,
            served_from_store: 60,
            failed_ranges: None,
            cancelled: false,
        };
        store.record_sync(&entry).unwrap();
        store.record_sync(&NewSyncLog { cancelled: true, ..entry.clone() }).unwrap();

        let log = store.recent_sync_log(10).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].cancelled);
        assert_eq!(log[1].range_end, at_minute(99));
        assert_eq!(log[1].served_from_store, 60);
    }
}
