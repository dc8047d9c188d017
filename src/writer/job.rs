//! Write jobs and their completion callbacks

use crate::error::{Result, SyncError};
use crate::models::{CandleRecord, SeriesKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Queue a job is placed on; queues drain in declaration order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl WritePriority {
    pub const ALL: [WritePriority; 4] = [
        WritePriority::Critical,
        WritePriority::High,
        WritePriority::Normal,
        WritePriority::Low,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WritePriority::Critical => "critical",
            WritePriority::High => "high",
            WritePriority::Normal => "normal",
            WritePriority::Low => "low",
        }
    }
}

impl fmt::Display for WritePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WritePriority {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        WritePriority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| SyncError::Validation(format!("Unknown write priority: {}", s)))
    }
}

/// Proof that a job's rows are durable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub job_id: Uuid,
    pub rows_written: usize,
    pub committed_at: DateTime<Utc>,
    /// Writer-wide commit order, starting at 1
    pub commit_seq: u64,
}

pub type CompletionSender = oneshot::Sender<Result<WriteReceipt>>;
pub type CompletionReceiver = oneshot::Receiver<Result<WriteReceipt>>;

/// One batch of records waiting to be committed
pub struct WriteJob {
    pub id: Uuid,
    pub key: SeriesKey,
    pub records: Vec<CandleRecord>,
    pub priority: WritePriority,
    pub submitted_at: DateTime<Utc>,
    completion: Option<CompletionSender>,
}

impl WriteJob {
    pub fn new(
        key: SeriesKey,
        records: Vec<CandleRecord>,
        priority: WritePriority,
    ) -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            id: Uuid::new_v4(),
            key,
            records,
            priority,
            submitted_at: Utc::now(),
            completion: Some(tx),
        };
        (job, rx)
    }

    /// Rough in-memory footprint used for the size-triggered flush
    pub fn estimated_bytes(&self) -> usize {
        let per_record = std::mem::size_of::<CandleRecord>() + self.key.symbol.len();
        std::mem::size_of::<Self>() + self.records.len() * per_record
    }

    /// Hand the outcome to whoever submitted the job
    pub fn resolve(mut self, outcome: Result<WriteReceipt>) {
        if let Some(tx) = self.completion.take() {
            // a dropped receiver just means nobody is waiting
            let _ = tx.send(outcome);
        }
    }
}

impl fmt::Debug for WriteJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteJob")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("records", &self.records.len())
            .field("priority", &self.priority)
            .field("submitted_at", &self.submitted_at)
            .finish()
    }
}

/// Wait for a job's outcome
pub async fn wait_for(receiver: CompletionReceiver) -> Result<WriteReceipt> {
    receiver
        .await
        .map_err(|_| SyncError::WriterClosed("write job dropped before completion".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timeframe;

    #[test]
    fn test_priority_order() {
        let mut priorities = vec![WritePriority::Low, WritePriority::Critical, WritePriority::Normal];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![WritePriority::Critical, WritePriority::Normal, WritePriority::Low]
        );
        assert_eq!("HIGH".parse::<WritePriority>().unwrap(), WritePriority::High);
        assert!("urgent".parse::<WritePriority>().is_err());
    }

    #[tokio::test]
    async fn test_resolve_reaches_receiver() {
        let key = SeriesKey::new("BTC-USDT", Timeframe::Minute1);
        let (job, rx) = WriteJob::new(key, Vec::new(), WritePriority::High);
        let id = job.id;
        job.resolve(Ok(WriteReceipt {
            job_id: id,
            rows_written: 0,
            committed_at: Utc::now(),
            commit_seq: 1,
        }));
        assert_eq!(wait_for(rx).await.unwrap().job_id, id);
    }

    #[tokio::test]
    async fn test_dropped_job_reports_writer_closed() {
        let key = SeriesKey::new("BTC-USDT", Timeframe::Minute1);
        let (job, rx) = WriteJob::new(key, Vec::new(), WritePriority::Low);
        drop(job);
        assert!(matches!(wait_for(rx).await, Err(SyncError::WriterClosed(_))));
    }
}
