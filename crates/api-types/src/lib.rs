//! Shared API type definitions
//!
//! Types that cross component boundaries in the compute core: job priorities and
//! states, the persisted model catalog record, and the monitoring reports handed
//! to dashboards.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Job priority. Lower numeric value means the job is dispatched earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl JobPriority {
    pub const ALL: [JobPriority; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    pub fn value(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    /// Bonus in `[0, 1]` fed into device scoring; grows with priority.
    pub fn scoring_bonus(self) -> f64 {
        match self {
            Self::Critical => 1.0,
            Self::High => 0.75,
            Self::Normal => 0.5,
            Self::Low => 0.25,
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a GPU job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Kind of enhancement model held in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    StyleTransfer,
    SuperResolution,
    FrameInterpolation,
    QualityAssessment,
    Generic,
}

/// Catalog record describing a model artifact.
///
/// This is the persisted form: the registry file is a JSON object keyed by
/// `model_id` whose values are these records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub model_type: ModelType,
    pub version: String,
    pub size_mb: f64,
    /// GPU memory reserved while the model is resident, in MB
    pub gpu_memory_required: u64,
    #[serde(default)]
    pub supported_operations: Vec<String>,
    #[serde(default)]
    pub performance_characteristics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Where a model or job ended up running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "index")]
pub enum ComputeDevice {
    Gpu(u32),
    Cpu,
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gpu(index) => write!(f, "cuda:{index}"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

// Scheduler monitoring surface

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue_length: usize,
    pub active_jobs: usize,
    pub queued_by_priority: BTreeMap<String, usize>,
    /// Mean seconds between submission and dispatch over the result history
    pub average_wait_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub device_id: u32,
    pub name: String,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub utilization_percent: f64,
    pub temperature: f64,
    pub is_available: bool,
    pub current_job: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    pub jobs_per_minute: f64,
    pub success_rate: f64,
    pub average_execution_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerCounters {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub total_execution_secs: f64,
}

/// Snapshot returned by `GpuJobScheduler::get_performance_metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub queue_metrics: QueueMetrics,
    pub gpu_metrics: Vec<DeviceMetrics>,
    pub performance_metrics: ThroughputMetrics,
    pub statistics: SchedulerCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub category: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingOptimization {
    pub recommendations: Vec<Recommendation>,
    /// Overall scheduler health in `[0, 1]`
    pub optimization_score: f64,
}

// Memory monitoring surface

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMemoryStatus {
    pub device_id: u32,
    pub name: String,
    pub total_mb: u64,
    pub allocated_mb: u64,
    pub fragmented_mb: u64,
    pub available_mb: u64,
    pub memory_percent: f64,
    pub utilization_percent: f64,
    pub temperature: f64,
    pub active_allocations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuMemoryStatus {
    pub timestamp: DateTime<Utc>,
    pub devices: Vec<DeviceMemoryStatus>,
    pub total_mb: u64,
    pub allocated_mb: u64,
    pub available_mb: u64,
    pub memory_percent: f64,
    pub utilization_percent: f64,
    pub temperature: f64,
    pub active_allocations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighMemoryUsage,
    HighTemperature,
    HighUtilization,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::HighMemoryUsage => "high_memory_usage",
            Self::HighTemperature => "high_temperature",
            Self::HighUtilization => "high_utilization",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub device_id: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Stable,
    Decreasing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryTrends {
    pub samples: usize,
    pub average_utilization: f64,
    pub peak_utilization: f64,
    pub average_temperature: f64,
    pub peak_temperature: f64,
    pub direction: TrendDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPrediction {
    pub direction: TrendDirection,
    /// Utilization change in percentage points per minute
    pub rate_percent_per_minute: f64,
    /// Minutes until 95% utilization; `None` when not trending up
    pub minutes_to_exhaustion: Option<f64>,
    /// Rough confidence in `[0, 1]`, grows with the number of samples used
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRecord {
    pub timestamp: DateTime<Utc>,
    pub before_percent: f64,
    pub after_percent: f64,
    pub freed_mb: u64,
}

/// Snapshot returned by `GpuMemoryManager::get_gpu_monitoring_report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuMonitoringReport {
    pub gpu_status: GpuMemoryStatus,
    pub memory_trends: Option<MemoryTrends>,
    pub active_alerts: Vec<Alert>,
    pub optimization_history: Vec<OptimizationRecord>,
    pub memory_prediction: Option<MemoryPrediction>,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn priority_orders_by_value() {
        let mut priorities = vec![
            JobPriority::Low,
            JobPriority::Critical,
            JobPriority::Normal,
            JobPriority::High,
        ];
        priorities.sort();
        assert_eq!(priorities, JobPriority::ALL.to_vec());
        for pair in JobPriority::ALL.windows(2) {
            assert!(pair[0].value() < pair[1].value());
            assert!(pair[0].scoring_bonus() > pair[1].scoring_bonus());
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn model_info_omits_absent_optionals() {
        let info = ModelInfo {
            model_id: "esrgan_x4".to_string(),
            model_type: ModelType::SuperResolution,
            version: "1.0.0".to_string(),
            size_mb: 63.8,
            gpu_memory_required: 2048,
            supported_operations: vec!["upscale_4x".to_string()],
            performance_characteristics: BTreeMap::new(),
            file_path: None,
            download_url: None,
            checksum: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("file_path").is_none());
        assert_eq!(json["model_type"], "super_resolution");
    }

    #[test]
    fn compute_device_display() {
        assert_eq!(ComputeDevice::Gpu(1).to_string(), "cuda:1");
        assert_eq!(ComputeDevice::Cpu.to_string(), "cpu");
    }
}
