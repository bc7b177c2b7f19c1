//! Device scoring for job placement

use api_types::JobPriority;

use crate::devices::GpuDevice;
use crate::error::ComputeError;
use crate::error::Result;

/// Thermal term is 1.0 here, higher below and falling to 0 above.
const THERMAL_KNEE: f64 = 50.0;
/// Width of the fall-off, in degrees.
const THERMAL_SPAN: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub memory: f64,
    pub utilization: f64,
    pub temperature: f64,
    pub priority: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            memory: 0.4,
            utilization: 0.3,
            temperature: 0.2,
            priority: 0.1,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<()> {
        let all = [self.memory, self.utilization, self.temperature, self.priority];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ComputeError::config(
                "scoring weights must be finite and non-negative",
            ));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err(ComputeError::config("scoring weights must not all be zero"));
        }
        Ok(())
    }
}

pub struct DeviceScorer;

impl DeviceScorer {
    /// Placement score of `device` for a job at `priority`; higher is better.
    pub fn score(device: &GpuDevice, priority: JobPriority, weights: &ScoringWeights) -> f64 {
        let memory = if device.total_memory_mb == 0 {
            0.0
        } else {
            device.available_memory_mb() as f64 / device.total_memory_mb as f64
        };
        let utilization = 1.0 - device.utilization_percent.clamp(0.0, 100.0) / 100.0;
        let thermal = (1.0 - (device.temperature - THERMAL_KNEE) / THERMAL_SPAN).max(0.0);

        weights.memory * memory
            + weights.utilization * utilization
            + weights.temperature * thermal
            + weights.priority * priority.scoring_bonus()
    }

    /// Best idle device with room for `required_mb`. Ties go to the lowest id.
    pub fn select<'a>(
        devices: impl IntoIterator<Item = &'a GpuDevice>,
        required_mb: u64,
        priority: JobPriority,
        weights: &ScoringWeights,
    ) -> Option<u32> {
        let mut best: Option<(u32, f64)> = None;
        for device in devices {
            if !device.can_host(required_mb) {
                continue;
            }
            let score = Self::score(device, priority, weights);
            let better = match best {
                None => true,
                Some((best_id, best_score)) => {
                    score > best_score || (score == best_score && device.device_id < best_id)
                }
            };
            if better {
                best = Some((device.device_id, score));
            }
        }
        best.map(|(device_id, _)| device_id)
    }
}
