//! Candle Sync - market data caching engine
//!
//! Serves OHLCV candle requests from a local SQLite store and fetches only
//! the missing spans from a rate-limited upstream API, writing new rows back
//! through a prioritized batch writer.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod services;
pub mod state;
pub mod time_utils;
pub mod upstream;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use db::CandleStore;
pub use error::{Result, SyncError};
pub use models::{CandleRecord, SeriesKey, TimeRange, Timeframe};
pub use services::{CandleRequest, CandleSyncService, SyncOutcome};
pub use state::CandleEngine;
pub use upstream::CandleFetcher;
pub use writer::{BatchWriter, WritePriority};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default filter.
/// Returns false if a subscriber was already installed.
pub fn init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "candle_sync=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
