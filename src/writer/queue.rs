//! Per-priority job queues

use super::job::{WriteJob, WritePriority};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct PriorityQueues {
    queues: [VecDeque<WriteJob>; 4],
    bytes: [usize; 4],
}

impl PriorityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job; returns the estimated payload of its queue afterwards
    pub fn push(&mut self, job: WriteJob) -> usize {
        let idx = job.priority.index();
        self.bytes[idx] += job.estimated_bytes();
        self.queues[idx].push_back(job);
        self.bytes[idx]
    }

    /// Take every queued job: critical first, FIFO within a priority
    pub fn drain_all(&mut self) -> Vec<WriteJob> {
        let mut jobs = Vec::with_capacity(self.total_depth());
        for (queue, bytes) in self.queues.iter_mut().zip(self.bytes.iter_mut()) {
            jobs.extend(queue.drain(..));
            *bytes = 0;
        }
        jobs
    }

    pub fn depth(&self, priority: WritePriority) -> usize {
        self.queues[priority.index()].len()
    }

    pub fn bytes(&self, priority: WritePriority) -> usize {
        self.bytes[priority.index()]
    }

    pub fn total_depth(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.bytes.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_depth() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SeriesKey, Timeframe};
    use crate::test_support::{at_minute, synthetic_series};

    fn job(priority: WritePriority, rows: i64) -> WriteJob {
        let records = synthetic_series("BTC-USDT", Timeframe::Minute1, at_minute(0), rows);
        WriteJob::new(SeriesKey::new("BTC-USDT", Timeframe::Minute1), records, priority).0
    }

    #[test]
    fn test_drain_is_priority_then_fifo() {
        let mut queues = PriorityQueues::new();
        let low = job(WritePriority::Low, 1);
        let normal_a = job(WritePriority::Normal, 1);
        let critical = job(WritePriority::Critical, 1);
        let normal_b = job(WritePriority::Normal, 1);
        let expected = vec![critical.id, normal_a.id, normal_b.id, low.id];

        for j in [low, normal_a, critical, normal_b] {
            queues.push(j);
        }
        assert_eq!(queues.depth(WritePriority::Normal), 2);
        assert_eq!(queues.total_depth(), 4);

        let drained: Vec<_> = queues.drain_all().into_iter().map(|j| j.id).collect();
        assert_eq!(drained, expected);
        assert!(queues.is_empty());
        assert_eq!(queues.total_bytes(), 0);
    }

    #[test]
    fn test_bytes_tracked_per_priority() {
        let mut queues = PriorityQueues::new();
        let small = queues.push(job(WritePriority::High, 1));
        let larger = queues.push(job(WritePriority::High, 100));
        assert!(larger > small);
        assert_eq!(queues.bytes(WritePriority::High), larger);
        assert_eq!(queues.bytes(WritePriority::Low), 0);
    }
}
