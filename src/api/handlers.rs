//! Query API endpoint handlers

use super::types::*;
use crate::db::SeriesSummary;
use crate::error::SyncError;
use crate::models::Timeframe;
use crate::services::{CandleRequest, CandleSyncService, SyncOutcome};
use crate::writer::QueueStatus;
use axum::{
    extract::{Json, State},
    http::StatusCode,
};
use std::sync::Arc;
use tracing::{info, warn};

pub type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn ok<T>(data: T) -> ApiResult<T> {
    (StatusCode::OK, Json(ApiResponse::success_with_data(data)))
}

fn failure<T>(err: &SyncError) -> ApiResult<T> {
    let status = status_for(err);
    if status.is_server_error() {
        warn!("Request failed: {}", err);
    }
    (status, Json(ApiResponse::error(err)))
}

// ============================================================================
// Health Check
// ============================================================================

/// GET /health
pub async fn health_check() -> ApiResult<Empty> {
    (
        StatusCode::OK,
        Json(ApiResponse::success_with_message("Candle sync API is running")),
    )
}

// ============================================================================
// Candles
// ============================================================================

/// POST /api/v1/candles
pub async fn get_candles(
    State(service): State<Arc<CandleSyncService>>,
    Json(request): Json<CandleRequest>,
) -> ApiResult<SyncOutcome> {
    info!(
        "Candle request {} {} count={:?} start={:?} end={:?}",
        request.symbol, request.timeframe, request.count, request.start, request.end
    );
    match service.get_candles(request).await {
        Ok(outcome) => ok(outcome),
        Err(e) => failure(&e),
    }
}

/// POST /api/v1/candles/upsert
pub async fn upsert_candles(
    State(service): State<Arc<CandleSyncService>>,
    Json(request): Json<UpsertRequest>,
) -> ApiResult<UpsertData> {
    let queued = request.candles.len();
    let records = request
        .candles
        .into_iter()
        .map(|c| c.into_record(&request.symbol, request.timeframe))
        .collect();

    match service
        .enqueue_upsert(&request.symbol, request.timeframe, records, request.priority)
        .await
    {
        Ok(job_id) => ok(UpsertData { job_id, queued }),
        Err(e) => failure(&e),
    }
}

// ============================================================================
// Status and catalog
// ============================================================================

/// GET /api/v1/queue/status
pub async fn queue_status(State(service): State<Arc<CandleSyncService>>) -> ApiResult<QueueStatus> {
    ok(service.get_queue_status())
}

/// GET /api/v1/series
pub async fn list_series(
    State(service): State<Arc<CandleSyncService>>,
) -> ApiResult<Vec<SeriesSummary>> {
    match service.list_series().await {
        Ok(series) => ok(series),
        Err(e) => failure(&e),
    }
}

/// GET /api/v1/timeframes
pub async fn list_timeframes() -> ApiResult<Vec<TimeframeInfo>> {
    ok(Timeframe::ALL
        .into_iter()
        .map(|timeframe| TimeframeInfo {
            timeframe,
            seconds: timeframe.seconds(),
        })
        .collect())
}
