//! SQLite database models

use crate::models::Timeframe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounds of the stored rows inside a queried range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeBounds {
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
    pub count: i64,
}

/// Catalog entry for one stored series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub table_name: String,
    pub first_open_time: Option<DateTime<Utc>>,
    pub last_open_time: Option<DateTime<Utc>>,
    pub row_count: i64,
}

/// Result of a WAL checkpoint
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CheckpointStats {
    /// Set when the checkpoint could not finish because of concurrent activity
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// One completed sync request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub symbol: String,
    pub timeframe: String,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub status: String,
    pub upstream_calls: i64,
    pub served_from_store: i64,
    /// JSON array of failed sub-ranges, if any
    pub failed_ranges: Option<String>,
    pub cancelled: bool,
    pub finished_at: String,
}
