use serde::Deserialize;
use serde::Serialize;

/// Memory-pressure tier derived from aggregate GPU memory use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
    Critical,
}

impl MemoryPressure {
    pub fn from_percent(memory_percent: f64, thresholds: &PressureThresholds) -> Self {
        if memory_percent >= thresholds.critical {
            Self::Critical
        } else if memory_percent >= thresholds.high {
            Self::High
        } else if memory_percent >= thresholds.medium {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl std::fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Tier entry points and the memory percent each response aims for.
#[derive(Debug, Clone, PartialEq)]
pub struct PressureThresholds {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
    pub medium_target: f64,
    pub high_target: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            medium: 70.0,
            high: 85.0,
            critical: 95.0,
            medium_target: 70.0,
            high_target: 75.0,
        }
    }
}

impl PressureThresholds {
    pub fn validate(&self) -> Result<(), String> {
        let ordered = 0.0 < self.medium && self.medium < self.high && self.high < self.critical;
        if !ordered || self.critical > 100.0 {
            return Err(format!(
                "pressure thresholds must satisfy 0 < medium < high < critical <= 100, got {}/{}/{}",
                self.medium, self.high, self.critical
            ));
        }
        if self.medium_target <= 0.0 || self.high_target <= 0.0 {
            return Err("pressure targets must be positive".to_string());
        }
        if self.high_target > self.high {
            return Err(format!(
                "high target {} must not exceed the high threshold {}",
                self.high_target, self.high
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_follow_thresholds() {
        let t = PressureThresholds::default();
        assert_eq!(MemoryPressure::from_percent(10.0, &t), MemoryPressure::Low);
        assert_eq!(MemoryPressure::from_percent(70.0, &t), MemoryPressure::Medium);
        assert_eq!(MemoryPressure::from_percent(90.0, &t), MemoryPressure::High);
        assert_eq!(MemoryPressure::from_percent(99.0, &t), MemoryPressure::Critical);
        assert!(MemoryPressure::Critical > MemoryPressure::Low);
    }

    #[test]
    fn unordered_thresholds_are_rejected() {
        let t = PressureThresholds {
            medium: 90.0,
            ..PressureThresholds::default()
        };
        assert!(t.validate().is_err());
        assert!(PressureThresholds::default().validate().is_ok());
    }
}
