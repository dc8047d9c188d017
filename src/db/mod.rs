//! Persistence layer

pub mod sqlite;

pub use sqlite::models::{CheckpointStats, RangeBounds, SeriesSummary, SyncLogEntry};
pub use sqlite::{CandleStore, NewSyncLog};
