//! Sync request log
//!
//! One row per completed sync request, kept for diagnostics.

use super::models::SyncLogEntry;
use crate::time_utils::{epoch_seconds, from_epoch_seconds};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Result};

/// Values recorded for a finished request
#[derive(Debug, Clone)]
pub struct NewSyncLog<'a> {
    pub symbol: &'a str,
    pub timeframe: &'a str,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub status: &'a str,
    pub upstream_calls: i64,
    pub served_from_store: i64,
    pub failed_ranges: Option<String>,
    pub cancelled: bool,
}

pub fn insert(conn: &Connection, entry: &NewSyncLog<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_log (symbol, timeframe, range_start, range_end, status,
                               upstream_calls, served_from_store, failed_ranges, cancelled)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.symbol,
            entry.timeframe,
            epoch_seconds(entry.range_start),
            epoch_seconds(entry.range_end),
            entry.status,
            entry.upstream_calls,
            entry.served_from_store,
            entry.failed_ranges,
            entry.cancelled,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent entries, newest first
pub fn recent(conn: &Connection, limit: i64) -> Result<Vec<SyncLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, symbol, timeframe, range_start, range_end, status,
                upstream_calls, served_from_store, failed_ranges, cancelled, finished_at
         FROM sync_log
         ORDER BY id DESC
         LIMIT ?1",
    )?;

    let rows = stmt.query_map(params![limit], |row| {
        let start: i64 = row.get(3)?;
        let end: i64 = row.get(4)?;
        Ok(SyncLogEntry {
            id: row.get(0)?,
            symbol: row.get(1)?,
            timeframe: row.get(2)?,
            range_start: to_instant(3, start)?,
            range_end: to_instant(4, end)?,
            status: row.get(5)?,
            upstream_calls: row.get(6)?,
            served_from_store: row.get(7)?,
            failed_ranges: row.get(8)?,
            cancelled: row.get(9)?,
            finished_at: row.get(10)?,
        })
    })?;

    rows.collect()
}

fn to_instant(column: usize, secs: i64) -> Result<DateTime<Utc>> {
    from_epoch_seconds(secs)
        .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(column, secs))
}
