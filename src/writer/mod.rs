//! Asynchronous write-back to the candle store

mod batch_writer;
mod job;
mod queue;

pub use batch_writer::{BatchWriter, FlushSummary};
pub use job::{wait_for, CompletionReceiver, WriteJob, WritePriority, WriteReceipt};

use crate::scheduler::MaintenanceStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Depth and payload of one priority queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityDepth {
    pub priority: WritePriority,
    pub depth: usize,
    pub estimated_bytes: usize,
}

/// Snapshot of the write-back subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queues: Vec<PriorityDepth>,
    pub total_depth: usize,
    pub estimated_bytes: usize,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub rows_written: u64,
    pub last_flush: Option<DateTime<Utc>>,
    pub maintenance: MaintenanceStatus,
}
