//! Request and response bodies for the query API
//!
//! Numeric candle fields accept either JSON numbers or numeric strings, since
//! several market-data clients send prices as strings.

use crate::error::SyncError;
use crate::models::{CandleRecord, Timeframe};
use crate::writer::WritePriority;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

fn deserialize_flexible_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum FlexibleFloat {
        Float(f64),
        Int(i64),
        Str(String),
    }

    match FlexibleFloat::deserialize(deserializer)? {
        FlexibleFloat::Float(f) => Ok(f),
        FlexibleFloat::Int(i) => Ok(i as f64),
        FlexibleFloat::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Standard response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success_with_message(message: &str) -> Self {
        Self {
            status: "success".to_string(),
            message: Some(message.to_string()),
            code: None,
            data: None,
        }
    }

    pub fn success_with_data(data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: None,
            code: None,
            data: Some(data),
        }
    }

    pub fn error(err: &SyncError) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(err.to_string()),
            code: Some(err.code().to_string()),
            data: None,
        }
    }
}

/// Empty payload for message-only responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Empty {}

/// HTTP status for an engine error
pub fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::InvalidRange(_) | SyncError::Validation(_) => StatusCode::BAD_REQUEST,
        SyncError::Upstream(_) | SyncError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
        SyncError::WriterClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// One candle in an upsert body; series identity comes from the request
#[derive(Debug, Clone, Deserialize)]
pub struct CandleInput {
    pub open_time: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_flexible_f64")]
    pub open: f64,
    #[serde(deserialize_with = "deserialize_flexible_f64")]
    pub high: f64,
    #[serde(deserialize_with = "deserialize_flexible_f64")]
    pub low: f64,
    #[serde(deserialize_with = "deserialize_flexible_f64")]
    pub close: f64,
    #[serde(default, deserialize_with = "deserialize_flexible_f64")]
    pub quote_volume: f64,
    #[serde(default, deserialize_with = "deserialize_flexible_f64")]
    pub base_volume: f64,
    #[serde(default)]
    pub sequence: i64,
}

impl CandleInput {
    pub fn into_record(self, symbol: &str, timeframe: Timeframe) -> CandleRecord {
        CandleRecord {
            symbol: symbol.to_string(),
            timeframe,
            open_time: self.open_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            quote_volume: self.quote_volume,
            base_volume: self.base_volume,
            sequence: self.sequence,
        }
    }
}

/// POST /api/v1/candles/upsert
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: Vec<CandleInput>,
    #[serde(default)]
    pub priority: WritePriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertData {
    pub job_id: Uuid,
    pub queued: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeInfo {
    pub timeframe: Timeframe,
    pub seconds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candle_input_accepts_string_numbers() {
        let input: CandleInput = serde_json::from_str(
            r#"{"open_time":"2024-01-01T00:00:00Z","open":"100.5","high":101,"low":"99","close":100.0}"#,
        )
        .unwrap();
        assert_eq!(input.open, 100.5);
        assert_eq!(input.high, 101.0);
        assert_eq!(input.base_volume, 0.0);

        let record = input.into_record("BTC-USDT", Timeframe::Minute1);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_error_envelope_carries_code() {
        let err = SyncError::InvalidRange("count must be positive".into());
        let body = serde_json::to_value(ApiResponse::<Empty>::error(&err)).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["code"], "INVALID_RANGE");
        assert!(body.get("data").is_none());
        assert_eq!(status_for(&err), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_upstream_errors_map_to_bad_gateway() {
        let err = SyncError::UpstreamUnavailable {
            attempts: 3,
            message: "timeout".into(),
        };
        assert_eq!(status_for(&err), StatusCode::BAD_GATEWAY);
    }
}
