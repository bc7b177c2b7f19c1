use std::time::Duration;

use crate::error::ComputeError;
use crate::error::Result;

/// Tunables for [`super::GpuMemoryManager`].
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Samples kept for trends and prediction
    pub history_size: usize,
    pub alert_retention: Duration,
    pub memory_alert_percent: f64,
    pub memory_critical_percent: f64,
    pub temperature_alert: f64,
    pub temperature_critical: f64,
    pub utilization_alert_percent: f64,
    pub cleanup_cooldown: Duration,
    /// Share of every released allocation left behind as fragmentation
    pub fragmentation_ratio: f64,
    /// Share of fragmentation reclaimed by one forced cleanup
    pub defragmentation_ratio: f64,
    /// Most recent samples used by the exhaustion prediction
    pub prediction_window: usize,
    pub exhaustion_percent: f64,
    pub optimization_history_size: usize,
    pub telemetry_jitter: f64,
    pub telemetry_seed: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            history_size: 100,
            alert_retention: Duration::from_secs(3600),
            memory_alert_percent: 85.0,
            memory_critical_percent: 95.0,
            temperature_alert: 80.0,
            temperature_critical: 90.0,
            utilization_alert_percent: 95.0,
            cleanup_cooldown: Duration::from_secs(30),
            fragmentation_ratio: 0.05,
            defragmentation_ratio: 0.8,
            prediction_window: 10,
            exhaustion_percent: 95.0,
            optimization_history_size: 50,
            telemetry_jitter: 2.0,
            telemetry_seed: None,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_size == 0 || self.optimization_history_size == 0 {
            return Err(ComputeError::config("history sizes must be at least 1"));
        }
        if self.prediction_window < 2 {
            return Err(ComputeError::config(
                "prediction window needs at least 2 samples",
            ));
        }
        for (name, ratio) in [
            ("fragmentation ratio", self.fragmentation_ratio),
            ("defragmentation ratio", self.defragmentation_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ComputeError::config(format!("{name} must be within [0, 1]")));
            }
        }
        for (name, percent) in [
            ("memory alert", self.memory_alert_percent),
            ("memory critical", self.memory_critical_percent),
            ("utilization alert", self.utilization_alert_percent),
            ("exhaustion", self.exhaustion_percent),
        ] {
            if !(0.0..=100.0).contains(&percent) {
                return Err(ComputeError::config(format!(
                    "{name} threshold {percent} is not a percentage"
                )));
            }
        }
        if self.memory_critical_percent < self.memory_alert_percent
            || self.temperature_critical < self.temperature_alert
        {
            return Err(ComputeError::config(
                "critical thresholds must not be below alert thresholds",
            ));
        }
        if self.telemetry_jitter < 0.0 {
            return Err(ComputeError::config("telemetry jitter must be non-negative"));
        }
        Ok(())
    }
}
