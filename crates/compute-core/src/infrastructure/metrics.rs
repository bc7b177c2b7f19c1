//! Line-protocol metrics emitted on the `metrics` tracing target.

use std::fmt;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use influxdb_line_protocol::LineProtocolBuilder;
use tokio_util::sync::CancellationToken;

use crate::memory::GpuMemoryManager;
use crate::models::ModelManager;
use crate::scheduler::GpuJobScheduler;

// Wrapper struct for Vec<u8> that implements Display
pub struct BytesWrapper(Vec<u8>);

impl fmt::Display for BytesWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "");
        }

        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => {
                tracing::error!(msg = "Failed to convert bytes to string",);
                Err(fmt::Error)
            }
        }
    }
}

impl From<Vec<u8>> for BytesWrapper {
    fn from(bytes: Vec<u8>) -> Self {
        BytesWrapper(bytes)
    }
}

/// Milliseconds since the unix epoch.
pub fn current_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Write one built line to the metrics sink.
pub fn emit(line: Vec<u8>) {
    let lp_str = BytesWrapper::from(line).to_string();
    tracing::info!(target: "metrics", msg = %lp_str);
}

/// Periodically write scheduler, device memory and model cache gauges.
pub async fn run_metrics(
    scheduler: GpuJobScheduler,
    memory: std::sync::Arc<GpuMemoryManager>,
    models: std::sync::Arc<ModelManager>,
    interval: Duration,
    node_name: &str,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                tracing::info!("Metrics reporter shutdown requested");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                report_once(&scheduler, &memory, &models, node_name).await;
            }
        }
    }
}

async fn report_once(
    scheduler: &GpuJobScheduler,
    memory: &GpuMemoryManager,
    models: &ModelManager,
    node_name: &str,
) {
    let timestamp = current_time();

    let perf = scheduler.get_performance_metrics();
    emit(
        LineProtocolBuilder::new()
            .measurement("compute_scheduler")
            .tag("node", node_name)
            .field("queue_length", perf.queue_metrics.queue_length as u64)
            .field("active_jobs", perf.queue_metrics.active_jobs as u64)
            .field("average_wait_secs", perf.queue_metrics.average_wait_secs)
            .field("jobs_per_minute", perf.performance_metrics.jobs_per_minute)
            .field("success_rate", perf.performance_metrics.success_rate)
            .field("submitted", perf.statistics.submitted)
            .field("completed", perf.statistics.completed)
            .field("failed", perf.statistics.failed)
            .field("timed_out", perf.statistics.timed_out)
            .field("cancelled", perf.statistics.cancelled)
            .timestamp(timestamp)
            .close_line()
            .build(),
    );

    for device in memory.current_status().devices {
        emit(
            LineProtocolBuilder::new()
                .measurement("compute_gpu_memory")
                .tag("node", node_name)
                .tag("device", &device.device_id.to_string())
                .field("allocated_mb", device.allocated_mb)
                .field("available_mb", device.available_mb)
                .field("fragmented_mb", device.fragmented_mb)
                .field("memory_percent", device.memory_percent)
                .field("utilization_percent", device.utilization_percent)
                .field("temperature", device.temperature)
                .timestamp(timestamp)
                .close_line()
                .build(),
        );
    }

    let stats = models.get_stats().await;
    emit(
        LineProtocolBuilder::new()
            .measurement("compute_model_cache")
            .tag("node", node_name)
            .field("loaded", stats.loaded_models as u64)
            .field("cache_hits", stats.cache_hits)
            .field("cache_misses", stats.cache_misses)
            .field("evictions", stats.evictions)
            .field("cpu_fallbacks", stats.cpu_fallbacks)
            .field("average_load_secs", stats.average_load_secs)
            .timestamp(timestamp)
            .close_line()
            .build(),
    );
}
