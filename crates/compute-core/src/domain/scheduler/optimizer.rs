//! Advisory scheduling recommendations and the overall health score

use api_types::PerformanceMetrics;
use api_types::Recommendation;
use api_types::SchedulingOptimization;

use crate::error::ComputeError;
use crate::error::Result;

/// Inclusive band of values considered optimal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub low: f64,
    pub high: f64,
}

impl Band {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// 1.0 inside the band, gaussian fall-off with `sigma` outside it.
    pub fn fitness(&self, value: f64, sigma: f64) -> f64 {
        let distance = if value < self.low {
            self.low - value
        } else if value > self.high {
            value - self.high
        } else {
            return 1.0;
        };
        (-(distance * distance) / (2.0 * sigma * sigma)).exp()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    pub queue_depth_warning: usize,
    pub high_utilization_percent: f64,
    pub low_utilization_percent: f64,
    pub success_rate_floor: f64,
    pub execution_time_ceiling_secs: f64,
    pub optimal_queue_depth: Band,
    pub queue_depth_sigma: f64,
    pub optimal_utilization: Band,
    pub utilization_sigma: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            queue_depth_warning: 10,
            high_utilization_percent: 90.0,
            low_utilization_percent: 20.0,
            success_rate_floor: 0.9,
            execution_time_ceiling_secs: 60.0,
            optimal_queue_depth: Band::new(2.0, 5.0),
            queue_depth_sigma: 3.0,
            optimal_utilization: Band::new(60.0, 80.0),
            utilization_sigma: 20.0,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, band) in [
            ("optimal queue depth", self.optimal_queue_depth),
            ("optimal utilization", self.optimal_utilization),
        ] {
            if !(band.low.is_finite() && band.high.is_finite()) || band.low > band.high {
                return Err(ComputeError::config(format!(
                    "{name} band [{}, {}] is not ordered",
                    band.low, band.high
                )));
            }
        }
        if self.queue_depth_sigma <= 0.0 || self.utilization_sigma <= 0.0 {
            return Err(ComputeError::config("fitness sigma must be positive"));
        }
        if self.low_utilization_percent > self.high_utilization_percent {
            return Err(ComputeError::config(
                "low utilization threshold exceeds the high one",
            ));
        }
        if !(0.0..=1.0).contains(&self.success_rate_floor) {
            return Err(ComputeError::config("success rate floor must be within [0, 1]"));
        }
        Ok(())
    }
}

pub struct SchedulingOptimizer;

impl SchedulingOptimizer {
    pub fn evaluate(metrics: &PerformanceMetrics, cfg: &OptimizerConfig) -> SchedulingOptimization {
        let mut recommendations = Vec::new();
        let queue_length = metrics.queue_metrics.queue_length;

        if queue_length > cfg.queue_depth_warning {
            recommendations.push(recommend(
                "queue",
                format!(
                    "{queue_length} jobs waiting; consider adding GPU capacity or shedding low priority work"
                ),
            ));
        }

        for device in &metrics.gpu_metrics {
            if device.utilization_percent > cfg.high_utilization_percent {
                recommendations.push(recommend(
                    "utilization",
                    format!(
                        "GPU {} at {:.0}% utilization; route new work elsewhere",
                        device.device_id, device.utilization_percent
                    ),
                ));
            } else if device.utilization_percent < cfg.low_utilization_percent && queue_length > 0 {
                recommendations.push(recommend(
                    "utilization",
                    format!(
                        "GPU {} underused at {:.0}% while jobs are queued; check memory requirements",
                        device.device_id, device.utilization_percent
                    ),
                ));
            }
        }

        let throughput = &metrics.performance_metrics;
        if throughput.success_rate < cfg.success_rate_floor {
            recommendations.push(recommend(
                "reliability",
                format!(
                    "success rate {:.1}% is below {:.1}%; inspect failing jobs",
                    throughput.success_rate * 100.0,
                    cfg.success_rate_floor * 100.0
                ),
            ));
        }
        if throughput.average_execution_secs > cfg.execution_time_ceiling_secs {
            recommendations.push(recommend(
                "performance",
                format!(
                    "average execution time {:.1}s exceeds {:.1}s; consider smaller batches",
                    throughput.average_execution_secs, cfg.execution_time_ceiling_secs
                ),
            ));
        }

        SchedulingOptimization {
            recommendations,
            optimization_score: Self::score(metrics, cfg),
        }
    }

    /// `0.4 * success + 0.3 * queue fitness + 0.3 * utilization fitness`
    pub fn score(metrics: &PerformanceMetrics, cfg: &OptimizerConfig) -> f64 {
        let success = metrics.performance_metrics.success_rate.clamp(0.0, 1.0);
        let queue = cfg
            .optimal_queue_depth
            .fitness(metrics.queue_metrics.queue_length as f64, cfg.queue_depth_sigma);

        let devices = &metrics.gpu_metrics;
        let mean_utilization = if devices.is_empty() {
            0.0
        } else {
            devices.iter().map(|d| d.utilization_percent).sum::<f64>() / devices.len() as f64
        };
        let utilization = cfg
            .optimal_utilization
            .fitness(mean_utilization, cfg.utilization_sigma);

        (0.4 * success + 0.3 * queue + 0.3 * utilization).clamp(0.0, 1.0)
    }
}

fn recommend(category: &str, message: String) -> Recommendation {
    Recommendation {
        category: category.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use api_types::DeviceMetrics;
    use api_types::QueueMetrics;
    use api_types::SchedulerCounters;
    use api_types::ThroughputMetrics;
    use similar_asserts::assert_eq;

    use super::*;

    fn metrics(queue_length: usize, utilization: &[f64], success_rate: f64) -> PerformanceMetrics {
        PerformanceMetrics {
            queue_metrics: QueueMetrics {
                queue_length,
                active_jobs: 0,
                queued_by_priority: BTreeMap::new(),
                average_wait_secs: 0.0,
            },
            gpu_metrics: utilization
                .iter()
                .enumerate()
                .map(|(i, util)| DeviceMetrics {
                    device_id: i as u32,
                    name: "sim".to_string(),
                    total_memory_mb: 8192,
                    available_memory_mb: 8192,
                    utilization_percent: *util,
                    temperature: 50.0,
                    is_available: true,
                    current_job: None,
                })
                .collect(),
            performance_metrics: ThroughputMetrics {
                jobs_per_minute: 0.0,
                success_rate,
                average_execution_secs: 1.0,
            },
            statistics: SchedulerCounters::default(),
        }
    }

    #[test]
    fn band_fitness_is_flat_inside_and_decays_outside() {
        let band = Band::new(2.0, 5.0);
        assert_eq!(band.fitness(3.0, 3.0), 1.0);
        assert_eq!(band.fitness(5.0, 3.0), 1.0);
        assert!(band.fitness(8.0, 3.0) < 1.0);
        assert!(band.fitness(20.0, 3.0) < band.fitness(8.0, 3.0));
    }

    #[test]
    fn ideal_state_scores_one_without_recommendations() {
        let cfg = OptimizerConfig::default();
        let result = SchedulingOptimizer::evaluate(&metrics(3, &[70.0, 65.0], 1.0), &cfg);
        assert!((result.optimization_score - 1.0).abs() < 1e-9);
        assert!(result.recommendations.is_empty());
    }

    #[test]
    fn flags_deep_queue_hot_device_and_low_success() {
        let cfg = OptimizerConfig::default();
        let result = SchedulingOptimizer::evaluate(&metrics(25, &[95.0], 0.5), &cfg);
        let categories: Vec<_> = result
            .recommendations
            .iter()
            .map(|r| r.category.as_str())
            .collect();
        assert_eq!(categories, vec!["queue", "utilization", "reliability"]);
        assert!(result.optimization_score < 0.5);
    }

    #[test]
    fn rejects_inverted_band() {
        let cfg = OptimizerConfig {
            optimal_utilization: Band::new(80.0, 60.0),
            ..OptimizerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
