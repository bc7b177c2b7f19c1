use std::any::Any;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use api_types::JobPriority;
use api_types::JobStatus;
use api_types::PerformanceMetrics;
use api_types::QueueMetrics;
use api_types::SchedulingOptimization;
use breaker::BreakerStats;
use breaker::CallError;
use breaker::CircuitBreaker;
use chrono::DateTime;
use chrono::Utc;
use futures::FutureExt;
use influxdb_line_protocol::LineProtocolBuilder;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::config::SchedulerConfig;
use super::optimizer::SchedulingOptimizer;
use super::queue::JobQueue;
use super::queue::QueuedJob;
use super::scoring::DeviceScorer;
use super::stats::SchedulerStats;
use super::types::GpuJobRequest;
use super::types::GpuJobResult;
use super::types::JobContext;
use super::types::JobError;
use super::types::JobSummary;
use super::types::JobType;
use crate::clock::seconds_between;
use crate::clock::SharedClock;
use crate::clock::SystemClock;
use crate::devices::GpuDevice;
use crate::devices::Telemetry;
use crate::error::ComputeError;
use crate::error::Result;
use crate::metrics::current_time;
use crate::metrics::emit;

/// What one dispatch cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub requeued: usize,
}

impl DispatchReport {
    pub fn made_progress(&self) -> bool {
        self.dispatched + self.failed + self.timed_out > 0
    }
}

#[derive(Debug)]
struct JobRecord {
    job_type: JobType,
    priority: JobPriority,
    status: JobStatus,
    device_id: Option<u32>,
    seq: u64,
}

#[derive(Debug)]
struct RunningJob {
    cancellation: CancellationToken,
}

#[derive(Debug)]
struct SchedulerState {
    queue: JobQueue,
    devices: BTreeMap<u32, GpuDevice>,
    running: HashMap<String, RunningJob>,
    jobs: HashMap<String, JobRecord>,
    results: HashMap<String, GpuJobResult>,
    stats: SchedulerStats,
    seq: u64,
    accepting: bool,
}

impl SchedulerState {
    /// Record the single terminal result of a job.
    fn finish(&mut self, result: GpuJobResult) {
        if let Some(record) = self.jobs.get_mut(&result.job_id) {
            record.status = result.status;
        }
        if let Some(evicted) = self.stats.record(&result) {
            self.results.remove(&evicted.job_id);
            self.jobs.remove(&evicted.job_id);
        }

        emit(
            LineProtocolBuilder::new()
                .measurement("compute_job")
                .tag("event", "finished")
                .tag("status", &result.status.to_string())
                .tag("job_id", &result.job_id)
                .field("execution_secs", result.execution_time_secs)
                .field("memory_mb", result.gpu_memory_used)
                .timestamp(current_time())
                .close_line()
                .build(),
        );
        self.results.insert(result.job_id.clone(), result);
    }
}

struct Shared {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    breaker: CircuitBreaker,
    clock: SharedClock,
    telemetry: Telemetry,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Priority scheduler that places GPU jobs on simulated devices.
///
/// Cloning is cheap and every clone drives the same queue and devices.
/// Dispatch bookkeeping happens under one mutex; callbacks run on spawned
/// tokio tasks through the circuit breaker.
#[derive(Clone)]
pub struct GpuJobScheduler {
    shared: Arc<Shared>,
}

struct Launch {
    job: QueuedJob,
    device_id: u32,
    cancellation: CancellationToken,
    started_at: DateTime<Utc>,
}

impl GpuJobScheduler {
    pub fn new(devices: Vec<GpuDevice>, config: SchedulerConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        if devices.is_empty() {
            return Err(ComputeError::config("scheduler needs at least one device"));
        }
        let mut by_id = BTreeMap::new();
        for device in devices {
            let device_id = device.device_id;
            if by_id.insert(device_id, device).is_some() {
                return Err(ComputeError::config(format!(
                    "device id {device_id} is listed twice"
                )));
            }
        }

        let breaker = CircuitBreaker::new("gpu-jobs", config.breaker.clone())
            .map_err(|report| ComputeError::config(report.current_context().to_string()))?;
        let telemetry = Telemetry::new(config.telemetry_seed, config.telemetry_jitter);

        tracing::info!(
            devices = by_id.len(),
            history_size = config.history_size,
            "Initialized GPU job scheduler"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState {
                    queue: JobQueue::new(),
                    devices: by_id,
                    running: HashMap::new(),
                    jobs: HashMap::new(),
                    results: HashMap::new(),
                    stats: SchedulerStats::new(config.history_size),
                    seq: 0,
                    accepting: true,
                }),
                breaker,
                clock,
                telemetry,
                wake: Notify::new(),
                config,
            }),
        })
    }

    pub fn with_system_clock(devices: Vec<GpuDevice>, config: SchedulerConfig) -> Result<Self> {
        Self::new(devices, config, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn breaker_stats(&self) -> BreakerStats {
        self.shared.breaker.stats()
    }

    /// Queue a job and return its id. Never blocks on dispatch.
    pub fn submit_job(&self, request: GpuJobRequest) -> Result<String> {
        if request.timeout.is_zero() {
            return Err(ComputeError::config("job timeout must be positive"));
        }
        request.job_type.validate(&request.parameters)?;

        let job_id = request
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let created_at = request
            .created_at
            .unwrap_or_else(|| self.shared.clock.now());
        let priority = request.priority;
        let memory_mb = request.gpu_memory_required;
        let job_type = request.job_type.clone();

        {
            let mut state = self.shared.lock();
            if !state.accepting {
                return Err(ComputeError::ShutDown);
            }
            if state.jobs.contains_key(&job_id) {
                return Err(ComputeError::AlreadyExists {
                    kind: "job",
                    id: job_id,
                });
            }
            state.seq += 1;
            let seq = state.seq;
            state.jobs.insert(
                job_id.clone(),
                JobRecord {
                    job_type: job_type.clone(),
                    priority,
                    status: JobStatus::Queued,
                    device_id: None,
                    seq,
                },
            );
            state.stats.record_submission();
            state.queue.push(QueuedJob {
                job_id: job_id.clone(),
                request,
                created_at,
                seq,
            });
        }

        tracing::info!(
            job_id = %job_id,
            job_type = %job_type,
            priority = %priority,
            memory_mb,
            "Job queued"
        );
        emit(
            LineProtocolBuilder::new()
                .measurement("compute_job")
                .tag("event", "queued")
                .tag("priority", &priority.to_string())
                .tag("job_id", &job_id)
                .field("memory_mb", memory_mb)
                .timestamp(current_time())
                .close_line()
                .build(),
        );
        self.shared.wake.notify_one();
        Ok(job_id)
    }

    /// Cancel a queued job outright, or ask a running one to stop.
    ///
    /// Returns `false` for unknown or already finished jobs.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let now = self.shared.clock.now();
        let mut guard = self.shared.lock();
        let state = &mut *guard;

        if let Some(job) = state.queue.remove(job_id) {
            state.finish(unstarted_result(
                &job,
                JobStatus::Cancelled,
                "cancelled before dispatch".to_string(),
                now,
            ));
            tracing::info!(job_id, "Cancelled queued job");
            return true;
        }

        if let Some(running) = state.running.get(job_id) {
            running.cancellation.cancel();
            if let Some(record) = state.jobs.get_mut(job_id) {
                record.status = JobStatus::Cancelled;
            }
            tracing::info!(job_id, "Requested cancellation of running job");
            return true;
        }

        false
    }

    pub fn get_job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.shared.lock().jobs.get(job_id).map(|record| record.status)
    }

    pub fn get_job_result(&self, job_id: &str) -> Option<GpuJobResult> {
        self.shared.lock().results.get(job_id).cloned()
    }

    /// Every tracked job in submission order.
    pub fn list_jobs(&self) -> Vec<JobSummary> {
        let state = self.shared.lock();
        let mut records: Vec<_> = state.jobs.iter().collect();
        records.sort_by_key(|(_, record)| record.seq);
        records
            .into_iter()
            .map(|(job_id, record)| JobSummary {
                job_id: job_id.clone(),
                job_type: record.job_type.clone(),
                priority: record.priority,
                status: record.status,
                device_id: record.device_id,
            })
            .collect()
    }

    pub fn active_jobs(&self) -> usize {
        self.shared.lock().running.len()
    }

    pub fn queue_length(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn devices(&self) -> Vec<GpuDevice> {
        self.shared.lock().devices.values().cloned().collect()
    }

    /// Walk the queue once in priority order and start every job that fits.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch_once(&self) -> DispatchReport {
        let shared = &self.shared;
        let now = shared.clock.now();
        let mut report = DispatchReport::default();
        let mut launches = Vec::new();

        {
            let mut guard = shared.lock();
            let state = &mut *guard;

            for job in state.queue.drain_ordered() {
                let required = job.request.gpu_memory_required;

                if !state.devices.values().any(|d| d.could_host(required)) {
                    let largest = state
                        .devices
                        .values()
                        .filter(|d| d.is_available)
                        .map(|d| d.total_memory_mb)
                        .max()
                        .unwrap_or(0);
                    let reason = ComputeError::Capacity {
                        device: "any device".to_string(),
                        requested_mb: required,
                        available_mb: largest,
                    };
                    tracing::warn!(job_id = %job.job_id, %reason, "Job can never fit, failing it");
                    state.finish(unstarted_result(&job, JobStatus::Failed, reason.to_string(), now));
                    report.failed += 1;
                    continue;
                }

                let choice = DeviceScorer::select(
                    state.devices.values(),
                    required,
                    job.request.priority,
                    &shared.config.weights,
                );
                let Some(device_id) = choice else {
                    let waited = seconds_between(job.created_at, now);
                    if waited > job.request.timeout.as_secs_f64() {
                        tracing::warn!(job_id = %job.job_id, waited, "Job timed out waiting for a device");
                        let message = format!(
                            "timed out after {:?} waiting for a device",
                            job.request.timeout
                        );
                        state.finish(unstarted_result(&job, JobStatus::Timeout, message, now));
                        report.timed_out += 1;
                    } else {
                        state.queue.push(job);
                        report.requeued += 1;
                    }
                    continue;
                };

                let Some(device) = state.devices.get_mut(&device_id) else {
                    state.queue.push(job);
                    report.requeued += 1;
                    continue;
                };
                if let Err(e) = device.occupy(&job.job_id, required) {
                    tracing::warn!(job_id = %job.job_id, error = %e, "Device rejected job, requeueing");
                    state.queue.push(job);
                    report.requeued += 1;
                    continue;
                }
                shared
                    .telemetry
                    .apply(device, shared.config.utilization_step);

                let cancellation = CancellationToken::new();
                state.running.insert(
                    job.job_id.clone(),
                    RunningJob {
                        cancellation: cancellation.clone(),
                    },
                );
                if let Some(record) = state.jobs.get_mut(&job.job_id) {
                    record.status = JobStatus::Running;
                    record.device_id = Some(device_id);
                }
                launches.push(Launch {
                    job,
                    device_id,
                    cancellation,
                    started_at: now,
                });
                report.dispatched += 1;
            }
        }

        for launch in launches {
            tracing::info!(
                job_id = %launch.job.job_id,
                device_id = launch.device_id,
                priority = %launch.job.request.priority,
                "Dispatching job"
            );
            emit(
                LineProtocolBuilder::new()
                    .measurement("compute_job")
                    .tag("event", "dispatched")
                    .tag("device", &launch.device_id.to_string())
                    .tag("job_id", &launch.job.job_id)
                    .field("wait_secs", seconds_between(launch.job.created_at, now))
                    .timestamp(current_time())
                    .close_line()
                    .build(),
            );
            tokio::spawn(execute(self.shared.clone(), launch));
        }

        report
    }

    /// Dispatch loop. Sleeps with bounded exponential backoff while nothing can
    /// be dispatched and wakes early on submission or job completion.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        let cfg = &self.shared.config;
        let mut backoff = cfg.idle_backoff_min;
        tracing::info!("Job dispatch loop started");

        loop {
            let progressed = match std::panic::catch_unwind(AssertUnwindSafe(|| self.dispatch_once())) {
                Ok(report) => report.made_progress(),
                Err(panic) => {
                    tracing::error!(error = %panic_message(panic.as_ref()), "Dispatch cycle panicked");
                    false
                }
            };

            let pause = if progressed {
                backoff = cfg.idle_backoff_min;
                backoff
            } else {
                let pause = backoff;
                backoff = (backoff * 2).min(cfg.idle_backoff_max);
                pause
            };

            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::info!("Job dispatch loop shutdown requested");
                    break;
                }
                _ = self.shared.wake.notified() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Stop accepting work, cancel everything still queued and signal running
    /// jobs. Returns the number of queued jobs cancelled.
    pub fn shutdown(&self) -> usize {
        let now = self.shared.clock.now();
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        state.accepting = false;

        let queued = state.queue.drain_ordered();
        let cancelled = queued.len();
        for job in queued {
            state.finish(unstarted_result(
                &job,
                JobStatus::Cancelled,
                "scheduler shutting down".to_string(),
                now,
            ));
        }
        for running in state.running.values() {
            running.cancellation.cancel();
        }

        tracing::info!(
            cancelled,
            running = state.running.len(),
            "GPU job scheduler shut down"
        );
        cancelled
    }

    /// Poll until nothing is queued or running, or `timeout` passes.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                {
                    let state = self.shared.lock();
                    if state.queue.is_empty() && state.running.is_empty() {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    pub fn get_performance_metrics(&self) -> PerformanceMetrics {
        let now = self.shared.clock.now();
        let state = self.shared.lock();
        PerformanceMetrics {
            queue_metrics: QueueMetrics {
                queue_length: state.queue.len(),
                active_jobs: state.running.len(),
                queued_by_priority: state.queue.counts_by_priority(),
                average_wait_secs: state.stats.average_wait_secs(),
            },
            gpu_metrics: state.devices.values().map(GpuDevice::to_metrics).collect(),
            performance_metrics: state
                .stats
                .throughput(now, self.shared.config.throughput_window),
            statistics: state.stats.counters().clone(),
        }
    }

    pub fn optimize_scheduling(&self) -> SchedulingOptimization {
        let metrics = self.get_performance_metrics();
        let optimization = SchedulingOptimizer::evaluate(&metrics, &self.shared.config.optimizer);
        tracing::debug!(
            score = optimization.optimization_score,
            recommendations = optimization.recommendations.len(),
            "Evaluated scheduling health"
        );
        optimization
    }
}

fn unstarted_result(
    job: &QueuedJob,
    status: JobStatus,
    message: String,
    now: DateTime<Utc>,
) -> GpuJobResult {
    GpuJobResult {
        job_id: job.job_id.clone(),
        status,
        result: None,
        error_message: Some(message),
        execution_time_secs: 0.0,
        gpu_memory_used: 0,
        device_id: None,
        created_at: job.created_at,
        started_at: None,
        completed_at: now,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Holds a device for one job. Dropping it without [`DeviceLease::settle`]
/// still frees the device and records a failure.
struct DeviceLease {
    shared: Arc<Shared>,
    job_id: String,
    device_id: u32,
    memory_mb: u64,
    created_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    settled: bool,
}

impl DeviceLease {
    fn release(&self, state: &mut SchedulerState) {
        state.running.remove(&self.job_id);
        if let Some(device) = state.devices.get_mut(&self.device_id) {
            if device.vacate(&self.job_id, self.memory_mb) {
                self.shared
                    .telemetry
                    .apply(device, -self.shared.config.cooldown_step);
            }
        }
    }

    fn settle(mut self, result: GpuJobResult) {
        let shared = self.shared.clone();
        {
            let mut state = shared.lock();
            self.release(&mut state);
            state.finish(result);
        }
        self.settled = true;
        shared.wake.notify_one();
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let shared = self.shared.clone();
        {
            let mut state = shared.lock();
            self.release(&mut state);
            if !state.results.contains_key(&self.job_id) {
                state.finish(GpuJobResult {
                    job_id: self.job_id.clone(),
                    status: JobStatus::Failed,
                    result: None,
                    error_message: Some("execution aborted".to_string()),
                    execution_time_secs: seconds_between(self.started_at, shared.clock.now()),
                    gpu_memory_used: self.memory_mb,
                    device_id: Some(self.device_id),
                    created_at: self.created_at,
                    started_at: Some(self.started_at),
                    completed_at: shared.clock.now(),
                });
            }
        }
        shared.wake.notify_one();
    }
}

async fn execute(shared: Arc<Shared>, launch: Launch) {
    let Launch {
        job,
        device_id,
        cancellation,
        started_at,
    } = launch;
    let lease = DeviceLease {
        shared: shared.clone(),
        job_id: job.job_id.clone(),
        device_id,
        memory_mb: job.request.gpu_memory_required,
        created_at: job.created_at,
        started_at,
        settled: false,
    };

    let ctx = JobContext {
        job_id: job.job_id.clone(),
        device_id,
        parameters: job.request.parameters.clone(),
        cancellation,
    };
    let callback = job.request.callback.clone();
    let timer = tokio::time::Instant::now();

    // Cancellation is reported as a successful call so the breaker ignores it.
    let outcome = shared
        .breaker
        .call_with_timeout(job.request.timeout, || async move {
            match AssertUnwindSafe(async move { callback(ctx).await })
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Ok(Ok(value)),
                Ok(Err(JobError::Cancelled)) => Ok(Err(JobError::Cancelled)),
                Ok(Err(e)) => Err(e),
                Err(panic) => Err(JobError::Panicked(panic_message(panic.as_ref()))),
            }
        })
        .await;

    let (status, value, error_message) = match outcome {
        Ok(Ok(value)) => (JobStatus::Completed, Some(value), None),
        Ok(Err(_)) => (JobStatus::Cancelled, None, Some("job cancelled".to_string())),
        Err(CallError::Open) => (
            JobStatus::Failed,
            None,
            Some("circuit breaker open".to_string()),
        ),
        Err(CallError::Timeout(limit)) => (
            JobStatus::Timeout,
            None,
            Some(format!("job exceeded timeout of {limit:?}")),
        ),
        Err(CallError::Inner(e)) => (JobStatus::Failed, None, Some(e.to_string())),
    };
    let elapsed = timer.elapsed();

    match status {
        JobStatus::Completed => tracing::info!(
            job_id = %job.job_id,
            device_id,
            elapsed = ?elapsed,
            "Job completed"
        ),
        _ => tracing::warn!(
            job_id = %job.job_id,
            device_id,
            status = %status,
            error = error_message.as_deref().unwrap_or_default(),
            "Job did not complete"
        ),
    }

    lease.settle(GpuJobResult {
        job_id: job.job_id,
        status,
        result: value,
        error_message,
        execution_time_secs: elapsed.as_secs_f64(),
        gpu_memory_used: job.request.gpu_memory_required,
        device_id: Some(device_id),
        created_at: job.created_at,
        started_at: Some(started_at),
        completed_at: shared.clock.now(),
    });
}
