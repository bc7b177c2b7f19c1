//! Rolling scheduler statistics

use std::collections::VecDeque;
use std::time::Duration;

use api_types::JobStatus;
use api_types::SchedulerCounters;
use api_types::ThroughputMetrics;
use chrono::DateTime;
use chrono::Utc;

use super::types::GpuJobResult;

#[derive(Debug)]
pub struct SchedulerStats {
    counters: SchedulerCounters,
    history: VecDeque<GpuJobResult>,
    capacity: usize,
}

impl SchedulerStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            counters: SchedulerCounters::default(),
            history: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn counters(&self) -> &SchedulerCounters {
        &self.counters
    }

    pub fn record_submission(&mut self) {
        self.counters.submitted += 1;
    }

    /// Count a terminal result and append it to the history. Returns the entry
    /// pushed out of the ring, if any.
    pub fn record(&mut self, result: &GpuJobResult) -> Option<GpuJobResult> {
        match result.status {
            JobStatus::Completed => self.counters.completed += 1,
            JobStatus::Failed => self.counters.failed += 1,
            JobStatus::Timeout => self.counters.timed_out += 1,
            JobStatus::Cancelled => self.counters.cancelled += 1,
            JobStatus::Pending | JobStatus::Queued | JobStatus::Running => {}
        }
        self.counters.total_execution_secs += result.execution_time_secs;

        let evicted = if self.history.len() >= self.capacity {
            self.history.pop_front()
        } else {
            None
        };
        self.history.push_back(result.clone());
        evicted
    }

    pub fn history(&self) -> impl Iterator<Item = &GpuJobResult> {
        self.history.iter()
    }

    /// Share of finished jobs that completed, over the history. Cancelled
    /// jobs are left out. An empty history counts as fully successful.
    pub fn success_rate(&self) -> f64 {
        let (ok, finished) = self
            .history
            .iter()
            .filter(|result| result.status != JobStatus::Cancelled)
            .fold((0usize, 0usize), |(ok, finished), result| {
                let ok = ok + usize::from(result.status == JobStatus::Completed);
                (ok, finished + 1)
            });
        if finished == 0 {
            1.0
        } else {
            ok as f64 / finished as f64
        }
    }

    /// Jobs finished per minute within `window` before `now`.
    pub fn jobs_per_minute(&self, now: DateTime<Utc>, window: Duration) -> f64 {
        let minutes = window.as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        let Ok(span) = chrono::Duration::from_std(window) else {
            return 0.0;
        };
        let since = now - span;
        let recent = self
            .history
            .iter()
            .filter(|result| result.completed_at > since && result.completed_at <= now)
            .count();
        recent as f64 / minutes
    }

    pub fn average_execution_secs(&self) -> f64 {
        mean(
            self.history
                .iter()
                .filter(|result| result.started_at.is_some())
                .map(|result| result.execution_time_secs),
        )
    }

    pub fn average_wait_secs(&self) -> f64 {
        mean(self.history.iter().filter_map(GpuJobResult::wait_secs))
    }

    pub fn throughput(&self, now: DateTime<Utc>, window: Duration) -> ThroughputMetrics {
        ThroughputMetrics {
            jobs_per_minute: self.jobs_per_minute(now, window),
            success_rate: self.success_rate(),
            average_execution_secs: self.average_execution_secs(),
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
