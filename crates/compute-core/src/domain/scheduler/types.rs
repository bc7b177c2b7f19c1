//! Job request/result types for the GPU job scheduler.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use api_types::JobPriority;
use api_types::JobStatus;
use chrono::DateTime;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::ComputeError;
use crate::error::Result;

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    StyleTransfer,
    SuperResolution,
    FrameInterpolation,
    QualityAssessment,
    Custom(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Text,
    Number,
    Integer,
    Flag,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "a string",
            Self::Number => "a number",
            Self::Integer => "an integer",
            Self::Flag => "a boolean",
        };
        f.write_str(name)
    }
}

const COMMON_KEYS: &[(&str, ParamKind)] = &[
    ("model_id", ParamKind::Text),
    ("input_path", ParamKind::Text),
    ("output_path", ParamKind::Text),
];

const STYLE_TRANSFER_KEYS: &[(&str, ParamKind)] = &[
    ("style", ParamKind::Text),
    ("strength", ParamKind::Number),
    ("preserve_color", ParamKind::Flag),
];

const SUPER_RESOLUTION_KEYS: &[(&str, ParamKind)] = &[
    ("scale_factor", ParamKind::Integer),
    ("tile_size", ParamKind::Integer),
    ("denoise_strength", ParamKind::Number),
];

const FRAME_INTERPOLATION_KEYS: &[(&str, ParamKind)] = &[
    ("multiplier", ParamKind::Integer),
    ("target_fps", ParamKind::Number),
];

const QUALITY_ASSESSMENT_KEYS: &[(&str, ParamKind)] = &[
    ("metric", ParamKind::Text),
    ("reference_path", ParamKind::Text),
];

impl JobType {
    /// Type-specific keys; `None` means any key is accepted.
    fn specific_keys(&self) -> Option<&'static [(&'static str, ParamKind)]> {
        match self {
            Self::StyleTransfer => Some(STYLE_TRANSFER_KEYS),
            Self::SuperResolution => Some(SUPER_RESOLUTION_KEYS),
            Self::FrameInterpolation => Some(FRAME_INTERPOLATION_KEYS),
            Self::QualityAssessment => Some(QUALITY_ASSESSMENT_KEYS),
            Self::Custom(_) => None,
        }
    }

    /// Check every parameter against the keys recognized for this job type.
    pub fn validate(&self, params: &JobParameters) -> Result<()> {
        let Some(specific) = self.specific_keys() else {
            return Ok(());
        };
        for (key, value) in params.iter() {
            let kind = COMMON_KEYS
                .iter()
                .chain(specific)
                .find(|(known, _)| *known == key)
                .map(|(_, kind)| *kind)
                .ok_or_else(|| ComputeError::InvalidParameter {
                    job_type: self.to_string(),
                    key: key.to_string(),
                    reason: "unrecognized key".to_string(),
                })?;
            if !value.matches(kind) {
                return Err(ComputeError::InvalidParameter {
                    job_type: self.to_string(),
                    key: key.to_string(),
                    reason: format!("expected {kind}"),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StyleTransfer => f.write_str("style_transfer"),
            Self::SuperResolution => f.write_str("super_resolution"),
            Self::FrameInterpolation => f.write_str("frame_interpolation"),
            Self::QualityAssessment => f.write_str("quality_assessment"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl ParamValue {
    fn matches(&self, kind: ParamKind) -> bool {
        matches!(
            (self, kind),
            (Self::Text(_), ParamKind::Text)
                | (Self::Flag(_), ParamKind::Flag)
                | (Self::Integer(_), ParamKind::Integer)
                | (Self::Integer(_) | Self::Number(_), ParamKind::Number)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

/// Typed key/value parameters handed to a job callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters(BTreeMap<String, ParamValue>);

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a callback sees while it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub device_id: u32,
    pub parameters: JobParameters,
    /// Cancelled when `cancel_job` is called for a running job. Callbacks that
    /// observe it should return [`JobError::Cancelled`].
    pub cancellation: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),
    #[error("job cancelled")]
    Cancelled,
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

pub type JobOutput = std::result::Result<serde_json::Value, JobError>;

pub type JobCallback = Arc<dyn Fn(JobContext) -> BoxFuture<'static, JobOutput> + Send + Sync>;

/// Wrap an async closure as a [`JobCallback`].
pub fn job_fn<F, Fut>(f: F) -> JobCallback
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutput> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

#[derive(Clone)]
pub struct GpuJobRequest {
    /// Assigned at submission when absent
    pub job_id: Option<String>,
    pub job_type: JobType,
    pub priority: JobPriority,
    /// MB reserved on the device for the duration of the job
    pub gpu_memory_required: u64,
    pub estimated_duration: Duration,
    pub timeout: Duration,
    pub parameters: JobParameters,
    pub callback: JobCallback,
    /// Defaults to the scheduler clock at submission
    pub created_at: Option<DateTime<Utc>>,
}

impl GpuJobRequest {
    pub fn new(job_type: JobType, callback: JobCallback) -> Self {
        Self {
            job_id: None,
            job_type,
            priority: JobPriority::Normal,
            gpu_memory_required: 0,
            estimated_duration: Duration::ZERO,
            timeout: DEFAULT_JOB_TIMEOUT,
            parameters: JobParameters::default(),
            callback,
            created_at: None,
        }
    }

    pub fn with_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_memory(mut self, gpu_memory_required: u64) -> Self {
        self.gpu_memory_required = gpu_memory_required;
        self
    }

    pub fn with_estimated_duration(mut self, estimated_duration: Duration) -> Self {
        self.estimated_duration = estimated_duration;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_parameters(mut self, parameters: JobParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

impl fmt::Debug for GpuJobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuJobRequest")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("priority", &self.priority)
            .field("gpu_memory_required", &self.gpu_memory_required)
            .field("estimated_duration", &self.estimated_duration)
            .field("timeout", &self.timeout)
            .field("parameters", &self.parameters)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Terminal record of one job attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuJobResult {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub execution_time_secs: f64,
    pub gpu_memory_used: u64,
    pub device_id: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
}

impl GpuJobResult {
    /// Seconds spent queued, if the job ever started.
    pub fn wait_secs(&self) -> Option<f64> {
        self.started_at
            .map(|started| crate::clock::seconds_between(self.created_at, started))
    }
}

/// Row returned by `GpuJobScheduler::list_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub job_type: JobType,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub device_id: Option<u32>,
}
