//! Engine configuration
//!
//! Every section deserializes with defaults, so a config file only needs the
//! values it overrides.

use crate::error::{Result, SyncError};
use crate::time_utils::MAX_CANDLES_PER_CALL;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub upstream: UpstreamConfig,
    pub sync: SyncConfig,
    pub writer: WriterConfig,
    pub maintenance: MaintenanceConfig,
    pub api: ApiConfig,
}

/// Local store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// Connections shared by the read and write paths
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
    /// How often the series-table existence cache is reloaded
    pub registry_refresh_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("candles.db"),
            pool_size: 10,
            busy_timeout_ms: 5_000,
            registry_refresh_secs: 300,
        }
    }
}

/// Upstream fetch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Request ceiling imposed by the upstream API
    pub requests_per_minute: u32,
    pub max_per_call: i64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 300,
            max_per_call: MAX_CANDLES_PER_CALL,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
        }
    }
}

impl UpstreamConfig {
    /// Minimum spacing between two dispatched fetches (`60 / rpm` seconds)
    pub fn min_spacing(&self) -> Duration {
        Duration::from_secs_f64(60.0 / f64::from(self.requests_per_minute.max(1)))
    }
}

/// Request handling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Ceiling on the number of candles one request may span
    pub max_request_count: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_request_count: 10_000,
        }
    }
}

/// Batch writer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub flush_interval_secs: u64,
    /// Estimated payload per priority queue that forces an immediate flush
    pub max_queue_bytes: usize,
    /// Total queued jobs above which submissions flush before being accepted
    pub max_queue_depth: usize,
    /// Rows per `upsert_batch` transaction
    pub batch_rows: usize,
    pub max_concurrent_commits: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 10,
            max_queue_bytes: 100 * 1024 * 1024,
            max_queue_depth: 10_000,
            batch_rows: 1_000,
            max_concurrent_commits: 3,
        }
    }
}

impl WriterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Periodic store maintenance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub checkpoint_interval_secs: u64,
    pub statistics_interval_secs: u64,
    pub compaction_interval_secs: u64,
    /// Free pages reclaimed per compaction run
    pub compaction_pages: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            checkpoint_interval_secs: 3_600,
            statistics_interval_secs: 3_600,
            compaction_interval_secs: 86_400,
            compaction_pages: 1_000,
        }
    }
}

/// HTTP query API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 5055,
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::info!("Loaded engine config from {:?}", path);
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.store.pool_size == 0 {
            return Err(SyncError::Config("store.pool_size must be at least 1".into()));
        }
        if self.upstream.requests_per_minute == 0 {
            return Err(SyncError::Config(
                "upstream.requests_per_minute must be at least 1".into(),
            ));
        }
        if !(1..=MAX_CANDLES_PER_CALL).contains(&self.upstream.max_per_call) {
            return Err(SyncError::Config(format!(
                "upstream.max_per_call must be between 1 and {}",
                MAX_CANDLES_PER_CALL
            )));
        }
        if self.upstream.max_attempts == 0 {
            return Err(SyncError::Config("upstream.max_attempts must be at least 1".into()));
        }
        if self.sync.max_request_count <= 0 {
            return Err(SyncError::Config("sync.max_request_count must be positive".into()));
        }
        if self.writer.batch_rows == 0 || self.writer.max_concurrent_commits == 0 {
            return Err(SyncError::Config(
                "writer.batch_rows and writer.max_concurrent_commits must be at least 1".into(),
            ));
        }
        if self.writer.flush_interval_secs == 0 || self.writer.max_queue_depth == 0 {
            return Err(SyncError::Config(
                "writer.flush_interval_secs and writer.max_queue_depth must be at least 1".into(),
            ));
        }
        let m = &self.maintenance;
        if m.checkpoint_interval_secs == 0
            || m.statistics_interval_secs == 0
            || m.compaction_interval_secs == 0
        {
            return Err(SyncError::Config("maintenance intervals must be positive".into()));
        }
        Ok(())
    }
}
