//! Priority queue of pending jobs

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::collections::HashMap;

use api_types::JobPriority;
use chrono::DateTime;
use chrono::Utc;
use priority_queue::PriorityQueue;

use super::types::GpuJobRequest;

/// Dispatch order: priority value, then submission time, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueKey {
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub seq: u64,
}

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: String,
    pub request: GpuJobRequest,
    pub created_at: DateTime<Utc>,
    pub seq: u64,
}

impl QueuedJob {
    pub fn key(&self) -> QueueKey {
        QueueKey {
            priority: self.request.priority.value(),
            created_at: self.created_at,
            seq: self.seq,
        }
    }
}

/// Smallest key pops first; removal by job id is O(log n).
#[derive(Debug, Default)]
pub struct JobQueue {
    order: PriorityQueue<String, Reverse<QueueKey>>,
    jobs: HashMap<String, QueuedJob>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: QueuedJob) {
        self.order.push(job.job_id.clone(), Reverse(job.key()));
        self.jobs.insert(job.job_id.clone(), job);
    }

    pub fn pop(&mut self) -> Option<QueuedJob> {
        let (job_id, _) = self.order.pop()?;
        self.jobs.remove(&job_id)
    }

    pub fn remove(&mut self, job_id: &str) -> Option<QueuedJob> {
        self.order.remove(job_id)?;
        self.jobs.remove(job_id)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn get(&self, job_id: &str) -> Option<&QueuedJob> {
        self.jobs.get(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Remove every job, in dispatch order.
    pub fn drain_ordered(&mut self) -> Vec<QueuedJob> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(job) = self.pop() {
            drained.push(job);
        }
        drained
    }

    /// Count of queued jobs for every priority level, including empty ones.
    pub fn counts_by_priority(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = JobPriority::ALL
            .iter()
            .map(|priority| (priority.to_string(), 0))
            .collect();
        for job in self.jobs.values() {
            *counts.entry(job.request.priority.to_string()).or_default() += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::scheduler::types::job_fn;
    use crate::scheduler::types::JobType;

    fn job(id: &str, priority: JobPriority, at_secs: i64, seq: u64) -> QueuedJob {
        let callback = job_fn(|_| async { Ok(serde_json::Value::Null) });
        QueuedJob {
            job_id: id.to_string(),
            request: GpuJobRequest::new(JobType::Custom("noop".into()), callback)
                .with_priority(priority),
            created_at: DateTime::from_timestamp(at_secs, 0).unwrap(),
            seq,
        }
    }

    #[test]
    fn pops_by_priority_then_time_then_sequence() {
        let mut queue = JobQueue::new();
        queue.push(job("low", JobPriority::Low, 0, 1));
        queue.push(job("normal-late", JobPriority::Normal, 5, 2));
        queue.push(job("normal-b", JobPriority::Normal, 1, 4));
        queue.push(job("normal-a", JobPriority::Normal, 1, 3));
        queue.push(job("critical", JobPriority::Critical, 9, 5));

        let order: Vec<_> = queue
            .drain_ordered()
            .into_iter()
            .map(|job| job.job_id)
            .collect();
        assert_eq!(
            order,
            vec!["critical", "normal-a", "normal-b", "normal-late", "low"]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_by_id() {
        let mut queue = JobQueue::new();
        queue.push(job("a", JobPriority::High, 0, 1));
        queue.push(job("b", JobPriority::High, 0, 2));
        assert!(queue.remove("a").is_some());
        assert!(queue.remove("a").is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().map(|job| job.job_id), Some("b".to_string()));
    }

    #[test]
    fn counts_include_every_priority() {
        let mut queue = JobQueue::new();
        queue.push(job("a", JobPriority::High, 0, 1));
        queue.push(job("b", JobPriority::High, 0, 2));
        let counts = queue.counts_by_priority();
        assert_eq!(counts.len(), 4);
        assert_eq!(counts["high"], 2);
        assert_eq!(counts["critical"], 0);
    }
}
