//! Range queries and batched upserts against one series table.
//!
//! `open_time` is the table's integer primary key, so every query below is a
//! single ordered range scan over the table B-tree.

use super::models::RangeBounds;
use crate::error::Result;
use crate::models::{step, CandleRecord, SeriesKey, TimeRange, Timeframe};
use crate::time_utils::{epoch_seconds, from_epoch_seconds};
use chrono::Utc;
use rusqlite::{params, Connection};

/// Consecutive stored rows whose spacing is not exactly one step
fn step_breaks_sql(table: &str) -> String {
    format!(
        r#"
        SELECT prev_time, open_time FROM (
            SELECT open_time, LAG(open_time) OVER (ORDER BY open_time) AS prev_time
            FROM "{table}"
            WHERE open_time BETWEEN ?1 AND ?2
        )
        WHERE prev_time IS NOT NULL AND open_time - prev_time <> ?3
        ORDER BY open_time
        "#
    )
}

pub fn has_any_data_in(conn: &Connection, table: &str, range: &TimeRange) -> Result<bool> {
    let exists: bool = conn.query_row(
        &format!(
            r#"SELECT EXISTS(SELECT 1 FROM "{table}" WHERE open_time BETWEEN ?1 AND ?2)"#
        ),
        params![epoch_seconds(range.start), epoch_seconds(range.end)],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub fn count_in_range(conn: &Connection, table: &str, range: &TimeRange) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!(r#"SELECT COUNT(*) FROM "{table}" WHERE open_time BETWEEN ?1 AND ?2"#),
        params![epoch_seconds(range.start), epoch_seconds(range.end)],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn range_bounds(conn: &Connection, table: &str, range: &TimeRange) -> Result<Option<RangeBounds>> {
    let (min, max, count): (Option<i64>, Option<i64>, i64) = conn.query_row(
        &format!(
            r#"SELECT MIN(open_time), MAX(open_time), COUNT(*) FROM "{table}"
               WHERE open_time BETWEEN ?1 AND ?2"#
        ),
        params![epoch_seconds(range.start), epoch_seconds(range.end)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    bounds_from(min, max, count)
}

/// Bounds over the whole table
pub fn table_bounds(conn: &Connection, table: &str) -> Result<Option<RangeBounds>> {
    let (min, max, count): (Option<i64>, Option<i64>, i64) = conn.query_row(
        &format!(r#"SELECT MIN(open_time), MAX(open_time), COUNT(*) FROM "{table}""#),
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    bounds_from(min, max, count)
}

fn bounds_from(min: Option<i64>, max: Option<i64>, count: i64) -> Result<Option<RangeBounds>> {
    match (min, max) {
        (Some(min), Some(max)) if count > 0 => Ok(Some(RangeBounds {
            min: from_epoch_seconds(min)?,
            max: from_epoch_seconds(max)?,
            count,
        })),
        _ => Ok(None),
    }
}

/// Holes between consecutive stored rows inside the range, oldest first
pub fn find_gaps(
    conn: &Connection,
    table: &str,
    range: &TimeRange,
    timeframe: Timeframe,
) -> Result<Vec<TimeRange>> {
    let mut stmt = conn.prepare(&step_breaks_sql(table))?;
    let breaks = stmt
        .query_map(
            params![
                epoch_seconds(range.start),
                epoch_seconds(range.end),
                timeframe.seconds()
            ],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut gaps = Vec::with_capacity(breaks.len());
    for (prev, next) in breaks {
        let start = from_epoch_seconds(prev)? + step(timeframe);
        let end = from_epoch_seconds(next)? - step(timeframe);
        if start > end {
            tracing::warn!(
                "Rows {} and {} in {} are closer than one {} step",
                prev,
                next,
                table,
                timeframe
            );
            continue;
        }
        gaps.push(TimeRange::for_timeframe(start, end, timeframe));
    }
    Ok(gaps)
}

/// Stored candles inside the range, ascending by open time
pub fn select_range(
    conn: &Connection,
    table: &str,
    key: &SeriesKey,
    range: &TimeRange,
) -> Result<Vec<CandleRecord>> {
    let mut stmt = conn.prepare(&format!(
        r#"SELECT open_time, open, high, low, close, quote_volume, base_volume, sequence
           FROM "{table}"
           WHERE open_time BETWEEN ?1 AND ?2
           ORDER BY open_time ASC"#
    ))?;

    let rows = stmt
        .query_map(
            params![epoch_seconds(range.start), epoch_seconds(range.end)],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(open_time, open, high, low, close, quote_volume, base_volume, sequence)| {
            Ok(CandleRecord {
                symbol: key.symbol.clone(),
                timeframe: key.timeframe,
                open_time: from_epoch_seconds(open_time)?,
                open,
                high,
                low,
                close,
                quote_volume,
                base_volume,
                sequence,
            })
        })
        .collect()
}

/// Insert or replace rows keyed by open time. Runs on whatever transaction
/// the caller holds; returns the number of rows written.
pub fn upsert(conn: &Connection, table: &str, records: &[CandleRecord]) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(&format!(
        r#"INSERT INTO "{table}"
             (open_time, symbol, timeframe, open, high, low, close,
              quote_volume, base_volume, sequence, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
           ON CONFLICT (open_time) DO UPDATE SET
             open = excluded.open, high = excluded.high, low = excluded.low,
             close = excluded.close, quote_volume = excluded.quote_volume,
             base_volume = excluded.base_volume, sequence = excluded.sequence,
             updated_at = excluded.updated_at"#
    ))?;

    let updated_at = Utc::now().timestamp_millis();
    let mut count = 0;
    for record in records {
        stmt.execute(params![
            epoch_seconds(record.open_time),
            record.symbol,
            record.timeframe.as_str(),
            record.open,
            record.high,
            record.low,
            record.close,
            record.quote_volume,
            record.base_volume,
            record.sequence,
            updated_at,
        ])?;
        count += 1;
    }

    Ok(count)
}
