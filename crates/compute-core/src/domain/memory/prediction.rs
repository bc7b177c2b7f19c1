//! Trend fitting over the sample history

use api_types::MemoryPrediction;
use api_types::MemoryTrends;
use api_types::TrendDirection;
use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

use crate::clock::seconds_between;

/// Slopes within this band (percent per minute) count as flat.
const FLAT_SLOPE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub memory_percent: f64,
    pub utilization_percent: f64,
    pub temperature: f64,
    pub available_mb: u64,
    pub active_allocations: usize,
}

/// Least-squares slope of memory percent per minute.
fn slope_per_minute(samples: &[&MemorySample]) -> Option<f64> {
    let first = samples.first()?.timestamp;
    let points: Vec<(f64, f64)> = samples
        .iter()
        .map(|s| (seconds_between(first, s.timestamp) / 60.0, s.memory_percent))
        .collect();
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let var_x: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if var_x <= f64::EPSILON {
        return None;
    }
    let cov: f64 = points
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    Some(cov / var_x)
}

fn direction(slope: f64) -> TrendDirection {
    if slope > FLAT_SLOPE {
        TrendDirection::Increasing
    } else if slope < -FLAT_SLOPE {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    }
}

pub fn trends<'a>(history: impl Iterator<Item = &'a MemorySample>) -> Option<MemoryTrends> {
    let samples: Vec<_> = history.collect();
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let average_utilization = samples.iter().map(|s| s.memory_percent).sum::<f64>() / n;
    let peak_utilization = samples
        .iter()
        .map(|s| s.memory_percent)
        .fold(f64::MIN, f64::max);
    let average_temperature = samples.iter().map(|s| s.temperature).sum::<f64>() / n;
    let peak_temperature = samples
        .iter()
        .map(|s| s.temperature)
        .fold(f64::MIN, f64::max);

    Some(MemoryTrends {
        samples: samples.len(),
        average_utilization,
        peak_utilization,
        average_temperature,
        peak_temperature,
        direction: slope_per_minute(&samples).map_or(TrendDirection::Stable, direction),
    })
}

/// Project the last `window` samples linearly to `exhaustion_percent`.
pub fn predict(
    history: &[&MemorySample],
    window: usize,
    exhaustion_percent: f64,
) -> Option<MemoryPrediction> {
    let start = history.len().saturating_sub(window);
    let recent = &history[start..];
    let slope = slope_per_minute(recent)?;
    let last = recent.last()?.memory_percent;
    let direction = direction(slope);

    let minutes_to_exhaustion = if last >= exhaustion_percent {
        Some(0.0)
    } else if direction == TrendDirection::Increasing {
        Some((exhaustion_percent - last) / slope)
    } else {
        None
    };

    Some(MemoryPrediction {
        direction,
        rate_percent_per_minute: slope,
        minutes_to_exhaustion,
        confidence: (recent.len() as f64 / window.max(1) as f64).min(1.0),
    })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn sample(minute: i64, percent: f64) -> MemorySample {
        MemorySample {
            timestamp: DateTime::from_timestamp(minute * 60, 0).unwrap(),
            memory_percent: percent,
            utilization_percent: percent,
            temperature: 50.0,
            available_mb: 0,
            active_allocations: 0,
        }
    }

    #[test]
    fn rising_usage_projects_exhaustion() {
        let history: Vec<_> = (0..5).map(|m| sample(m, 50.0 + 5.0 * m as f64)).collect();
        let refs: Vec<_> = history.iter().collect();
        let prediction = predict(&refs, 10, 95.0).unwrap();
        assert_eq!(prediction.direction, TrendDirection::Increasing);
        assert!((prediction.rate_percent_per_minute - 5.0).abs() < 1e-9);
        let minutes = prediction.minutes_to_exhaustion.unwrap();
        assert!((minutes - 5.0).abs() < 1e-9);
        assert_eq!(prediction.confidence, 0.5);
    }

    #[test]
    fn flat_usage_has_no_exhaustion() {
        let history: Vec<_> = (0..4).map(|m| sample(m, 40.0)).collect();
        let refs: Vec<_> = history.iter().collect();
        let prediction = predict(&refs, 3, 95.0).unwrap();
        assert_eq!(prediction.direction, TrendDirection::Stable);
        assert_eq!(prediction.minutes_to_exhaustion, None);
        assert_eq!(prediction.confidence, 1.0);
    }

    #[test]
    fn single_sample_cannot_predict() {
        let history = [sample(0, 10.0)];
        let refs: Vec<_> = history.iter().collect();
        assert!(predict(&refs, 10, 95.0).is_none());
        let trends = trends(history.iter()).unwrap();
        assert_eq!(trends.direction, TrendDirection::Stable);
        assert_eq!(trends.peak_utilization, 10.0);
    }
}
