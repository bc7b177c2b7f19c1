use std::fmt::Display;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context as _;
use breaker::CircuitBreakerConfig;
use serde::Deserialize;
use serde::Deserializer;

use crate::error::ComputeError;
use crate::memory::MemoryConfig;
use crate::models::ModelManagerConfig;
use crate::models::PressureThresholds;
use crate::scheduler::Band;
use crate::scheduler::OptimizerConfig;
use crate::scheduler::SchedulerConfig;
use crate::scheduler::ScoringWeights;

/// Scheduling configuration file. Every key is optional and falls back to the
/// built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulingFile {
    pub scheduler: SchedulerSection,
    pub memory: MemorySection,
    pub models: ModelsSection,
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSection {
    #[serde(deserialize_with = "number_or_string")]
    pub history_size: usize,
    #[serde(deserialize_with = "number_or_string")]
    pub throughput_window_secs: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub idle_backoff_min_ms: u64,
    #[serde(deserialize_with = "number_or_string")]
    pub idle_backoff_max_ms: u64,
    #[serde(deserialize_with = "number_or_string")]
    pub utilization_step: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub cooldown_step: f64,
    pub weights: WeightsSection,
    pub optimizer: OptimizerSection,
    pub breaker: BreakerSection,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            history_size: defaults.history_size,
            throughput_window_secs: defaults.throughput_window.as_secs_f64(),
            idle_backoff_min_ms: defaults.idle_backoff_min.as_millis() as u64,
            idle_backoff_max_ms: defaults.idle_backoff_max.as_millis() as u64,
            utilization_step: defaults.utilization_step,
            cooldown_step: defaults.cooldown_step,
            weights: WeightsSection::default(),
            optimizer: OptimizerSection::default(),
            breaker: BreakerSection::default(),
        }
    }
}

/// Device scoring weights
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightsSection {
    #[serde(deserialize_with = "number_or_string")]
    pub memory: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub utilization: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub temperature: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub priority: f64,
}

impl Default for WeightsSection {
    fn default() -> Self {
        let defaults = ScoringWeights::default();
        Self {
            memory: defaults.memory,
            utilization: defaults.utilization,
            temperature: defaults.temperature,
            priority: defaults.priority,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandSection {
    #[serde(deserialize_with = "number_or_string")]
    pub low: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub high: f64,
}

impl From<Band> for BandSection {
    fn from(band: Band) -> Self {
        Self {
            low: band.low,
            high: band.high,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizerSection {
    #[serde(deserialize_with = "number_or_string")]
    pub queue_depth_warning: usize,
    #[serde(deserialize_with = "number_or_string")]
    pub high_utilization_percent: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub low_utilization_percent: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub success_rate_floor: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub execution_time_ceiling_secs: f64,
    pub optimal_queue_depth: BandSection,
    #[serde(deserialize_with = "number_or_string")]
    pub queue_depth_sigma: f64,
    pub optimal_utilization: BandSection,
    #[serde(deserialize_with = "number_or_string")]
    pub utilization_sigma: f64,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        let defaults = OptimizerConfig::default();
        Self {
            queue_depth_warning: defaults.queue_depth_warning,
            high_utilization_percent: defaults.high_utilization_percent,
            low_utilization_percent: defaults.low_utilization_percent,
            success_rate_floor: defaults.success_rate_floor,
            execution_time_ceiling_secs: defaults.execution_time_ceiling_secs,
            optimal_queue_depth: defaults.optimal_queue_depth.into(),
            queue_depth_sigma: defaults.queue_depth_sigma,
            optimal_utilization: defaults.optimal_utilization.into(),
            utilization_sigma: defaults.utilization_sigma,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerSection {
    #[serde(deserialize_with = "number_or_string")]
    pub failure_threshold: u32,
    #[serde(deserialize_with = "number_or_string")]
    pub recovery_timeout_secs: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub call_timeout_secs: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub max_concurrent: usize,
    #[serde(deserialize_with = "number_or_string")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            recovery_timeout_secs: defaults.recovery_timeout.as_secs_f64(),
            call_timeout_secs: defaults.call_timeout.as_secs_f64(),
            max_concurrent: defaults.max_concurrent,
            half_open_max_calls: defaults.half_open_max_calls,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemorySection {
    #[serde(deserialize_with = "number_or_string")]
    pub history_size: usize,
    #[serde(deserialize_with = "number_or_string")]
    pub alert_retention_secs: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub memory_alert_percent: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub memory_critical_percent: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub temperature_alert: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub temperature_critical: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub utilization_alert_percent: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub cleanup_cooldown_secs: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub fragmentation_ratio: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub defragmentation_ratio: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub prediction_window: usize,
    #[serde(deserialize_with = "number_or_string")]
    pub exhaustion_percent: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub optimization_history_size: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        let defaults = MemoryConfig::default();
        Self {
            history_size: defaults.history_size,
            alert_retention_secs: defaults.alert_retention.as_secs_f64(),
            memory_alert_percent: defaults.memory_alert_percent,
            memory_critical_percent: defaults.memory_critical_percent,
            temperature_alert: defaults.temperature_alert,
            temperature_critical: defaults.temperature_critical,
            utilization_alert_percent: defaults.utilization_alert_percent,
            cleanup_cooldown_secs: defaults.cleanup_cooldown.as_secs_f64(),
            fragmentation_ratio: defaults.fragmentation_ratio,
            defragmentation_ratio: defaults.defragmentation_ratio,
            prediction_window: defaults.prediction_window,
            exhaustion_percent: defaults.exhaustion_percent,
            optimization_history_size: defaults.optimization_history_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelsSection {
    #[serde(deserialize_with = "number_or_string")]
    pub max_cache_size: usize,
    pub enable_download: bool,
    pub enable_cpu_fallback: bool,
    #[serde(deserialize_with = "number_or_string")]
    pub download_attempts: u32,
    #[serde(deserialize_with = "number_or_string")]
    pub download_retry_delay_secs: f64,
    pub pressure: PressureSection,
}

impl Default for ModelsSection {
    fn default() -> Self {
        let defaults = ModelManagerConfig::default();
        Self {
            max_cache_size: defaults.max_cache_size,
            enable_download: defaults.enable_download,
            enable_cpu_fallback: defaults.enable_cpu_fallback,
            download_attempts: defaults.download_attempts,
            download_retry_delay_secs: defaults.download_retry_delay.as_secs_f64(),
            pressure: PressureSection::default(),
        }
    }
}

/// Memory-pressure tiers, in percent of total GPU memory
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PressureSection {
    #[serde(deserialize_with = "number_or_string")]
    pub medium: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub high: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub critical: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub medium_target: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub high_target: f64,
}

impl Default for PressureSection {
    fn default() -> Self {
        let defaults = PressureThresholds::default();
        Self {
            medium: defaults.medium,
            high: defaults.high,
            critical: defaults.critical,
            medium_target: defaults.medium_target,
            high_target: defaults.high_target,
        }
    }
}

/// Simulated device telemetry shared by the scheduler and the memory manager
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySection {
    #[serde(deserialize_with = "number_or_string")]
    pub jitter: f64,
    pub seed: Option<u64>,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            jitter: SchedulerConfig::default().telemetry_jitter,
            seed: None,
        }
    }
}

impl SchedulingFile {
    pub fn scheduler_config(&self) -> Result<SchedulerConfig, ComputeError> {
        let s = &self.scheduler;
        let o = &s.optimizer;
        let b = &s.breaker;
        let config = SchedulerConfig {
            weights: ScoringWeights {
                memory: s.weights.memory,
                utilization: s.weights.utilization,
                temperature: s.weights.temperature,
                priority: s.weights.priority,
            },
            optimizer: OptimizerConfig {
                queue_depth_warning: o.queue_depth_warning,
                high_utilization_percent: o.high_utilization_percent,
                low_utilization_percent: o.low_utilization_percent,
                success_rate_floor: o.success_rate_floor,
                execution_time_ceiling_secs: o.execution_time_ceiling_secs,
                optimal_queue_depth: Band::new(o.optimal_queue_depth.low, o.optimal_queue_depth.high),
                queue_depth_sigma: o.queue_depth_sigma,
                optimal_utilization: Band::new(o.optimal_utilization.low, o.optimal_utilization.high),
                utilization_sigma: o.utilization_sigma,
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: b.failure_threshold,
                recovery_timeout: secs("scheduler.breaker.recoveryTimeoutSecs", b.recovery_timeout_secs)?,
                call_timeout: secs("scheduler.breaker.callTimeoutSecs", b.call_timeout_secs)?,
                max_concurrent: b.max_concurrent,
                half_open_max_calls: b.half_open_max_calls,
            },
            history_size: s.history_size,
            throughput_window: secs("scheduler.throughputWindowSecs", s.throughput_window_secs)?,
            idle_backoff_min: Duration::from_millis(s.idle_backoff_min_ms),
            idle_backoff_max: Duration::from_millis(s.idle_backoff_max_ms),
            utilization_step: s.utilization_step,
            cooldown_step: s.cooldown_step,
            telemetry_jitter: self.telemetry.jitter,
            telemetry_seed: self.telemetry.seed,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn memory_config(&self) -> Result<MemoryConfig, ComputeError> {
        let m = &self.memory;
        let config = MemoryConfig {
            history_size: m.history_size,
            alert_retention: secs("memory.alertRetentionSecs", m.alert_retention_secs)?,
            memory_alert_percent: m.memory_alert_percent,
            memory_critical_percent: m.memory_critical_percent,
            temperature_alert: m.temperature_alert,
            temperature_critical: m.temperature_critical,
            utilization_alert_percent: m.utilization_alert_percent,
            cleanup_cooldown: secs("memory.cleanupCooldownSecs", m.cleanup_cooldown_secs)?,
            fragmentation_ratio: m.fragmentation_ratio,
            defragmentation_ratio: m.defragmentation_ratio,
            prediction_window: m.prediction_window,
            exhaustion_percent: m.exhaustion_percent,
            optimization_history_size: m.optimization_history_size,
            telemetry_jitter: self.telemetry.jitter,
            telemetry_seed: self.telemetry.seed,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn model_manager_config(&self, models_dir: PathBuf) -> Result<ModelManagerConfig, ComputeError> {
        let m = &self.models;
        let config = ModelManagerConfig {
            max_cache_size: m.max_cache_size,
            models_dir,
            enable_download: m.enable_download,
            download_attempts: m.download_attempts,
            download_retry_delay: secs("models.downloadRetryDelaySecs", m.download_retry_delay_secs)?,
            enable_cpu_fallback: m.enable_cpu_fallback,
            pressure: PressureThresholds {
                medium: m.pressure.medium,
                high: m.pressure.high,
                critical: m.pressure.critical,
                medium_target: m.pressure.medium_target,
                high_target: m.pressure.high_target,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

/// Load the scheduling configuration; a missing path yields the defaults.
pub async fn load_scheduling_file(path: Option<&Path>) -> anyhow::Result<SchedulingFile> {
    let Some(path) = path else {
        return Ok(SchedulingFile::default());
    };
    tracing::info!("Loading scheduling configuration from {:?}", path);
    let yaml = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_scheduling_file(&yaml).with_context(|| format!("invalid scheduling config {}", path.display()))
}

pub fn parse_scheduling_file(yaml: &str) -> anyhow::Result<SchedulingFile> {
    if yaml.trim().is_empty() {
        return Ok(SchedulingFile::default());
    }
    Ok(serde_yaml::from_str(yaml)?)
}

fn secs(key: &str, value: f64) -> Result<Duration, ComputeError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| ComputeError::config(format!("{key} must be a non-negative number of seconds: {e}")))
}

/// Accepts a number either as-is or quoted, e.g. `0.4` or `"0.4"`.
fn number_or_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber<T> {
        String(String),
        Number(T),
    }

    match StringOrNumber::<T>::deserialize(deserializer)? {
        StringOrNumber::String(s) => s.trim().parse::<T>().map_err(|e| {
            serde::de::Error::custom(format!("Failed to parse number from string '{s}': {e}"))
        }),
        StringOrNumber::Number(n) => Ok(n),
    }
}
