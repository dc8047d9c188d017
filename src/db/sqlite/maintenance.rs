//! Store maintenance primitives: WAL checkpoint, planner statistics and
//! incremental compaction.

use super::models::CheckpointStats;
use rusqlite::{Connection, Result};

/// Fold the WAL back into the main database file without blocking writers
pub fn checkpoint(conn: &Connection) -> Result<CheckpointStats> {
    conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |row| {
        Ok(CheckpointStats {
            busy: row.get::<_, i64>(0)? != 0,
            log_frames: row.get(1)?,
            checkpointed_frames: row.get(2)?,
        })
    })
}

/// Refresh query planner statistics
pub fn refresh_statistics(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA optimize;")
}

/// Return up to `pages` free pages to the filesystem.
/// Returns the number of free pages left afterwards.
pub fn compact(conn: &Connection, pages: u32) -> Result<i64> {
    conn.execute_batch(&format!("PRAGMA incremental_vacuum({});", pages))?;
    conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))
}
