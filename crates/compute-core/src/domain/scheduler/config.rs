use std::time::Duration;

use breaker::CircuitBreakerConfig;

use super::optimizer::OptimizerConfig;
use super::scoring::ScoringWeights;
use crate::error::ComputeError;
use crate::error::Result;

/// Tunables for [`super::GpuJobScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub weights: ScoringWeights,
    pub optimizer: OptimizerConfig,
    pub breaker: CircuitBreakerConfig,
    /// Number of terminal results kept for statistics and lookups
    pub history_size: usize,
    pub throughput_window: Duration,
    /// First sleep of the dispatch loop when nothing could be dispatched
    pub idle_backoff_min: Duration,
    /// Upper bound of the idle sleep, reached by doubling
    pub idle_backoff_max: Duration,
    /// Utilization points added when a job lands on a device
    pub utilization_step: f64,
    /// Utilization points removed when a job leaves a device
    pub cooldown_step: f64,
    pub telemetry_jitter: f64,
    pub telemetry_seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            optimizer: OptimizerConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            history_size: 1000,
            throughput_window: Duration::from_secs(300),
            idle_backoff_min: Duration::from_millis(100),
            idle_backoff_max: Duration::from_secs(1),
            utilization_step: 25.0,
            cooldown_step: 25.0,
            telemetry_jitter: 2.0,
            telemetry_seed: None,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        self.weights.validate()?;
        self.optimizer.validate()?;
        self.breaker
            .validate()
            .map_err(|report| ComputeError::config(report.current_context().to_string()))?;

        if self.history_size == 0 {
            return Err(ComputeError::config("history size must be at least 1"));
        }
        if self.throughput_window.is_zero() {
            return Err(ComputeError::config("throughput window must be positive"));
        }
        if self.idle_backoff_min.is_zero() || self.idle_backoff_min > self.idle_backoff_max {
            return Err(ComputeError::config(format!(
                "idle backoff must satisfy 0 < min ({:?}) <= max ({:?})",
                self.idle_backoff_min, self.idle_backoff_max
            )));
        }
        if self.utilization_step < 0.0 || self.cooldown_step < 0.0 {
            return Err(ComputeError::config("utilization steps must be non-negative"));
        }
        if !self.telemetry_jitter.is_finite() || self.telemetry_jitter < 0.0 {
            return Err(ComputeError::config("telemetry jitter must be non-negative"));
        }
        Ok(())
    }
}
