//! HTTP query API
//!
//! Optional axum surface over [`CandleSyncService`](crate::services::CandleSyncService):
//! candle requests, upserts, queue status and the series catalog.

pub mod handlers;
mod server;
mod types;

pub use server::{router, ApiServer};
pub use types::{status_for, ApiResponse, CandleInput, Empty, TimeframeInfo, UpsertData, UpsertRequest};
