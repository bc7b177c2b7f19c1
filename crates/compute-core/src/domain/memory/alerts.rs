//! Threshold alerts with edge-triggered creation and time-based retention.

use std::collections::HashSet;
use std::time::Duration;

use api_types::Alert;
use api_types::AlertKind;
use api_types::AlertSeverity;
use chrono::DateTime;
use chrono::Utc;

#[derive(Debug, Clone, Copy)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

impl Threshold {
    fn severity(&self, value: f64) -> Option<(AlertSeverity, f64)> {
        if value >= self.critical {
            Some((AlertSeverity::Critical, self.critical))
        } else if value >= self.warning {
            Some((AlertSeverity::Warning, self.warning))
        } else {
            None
        }
    }
}

/// One alert per (kind, device) while the value stays above threshold; the
/// pair re-arms once the value drops back under it.
#[derive(Debug, Default)]
pub struct AlertBook {
    alerts: Vec<Alert>,
    firing: HashSet<(AlertKind, u32)>,
}

impl AlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `value` to `threshold`; returns the alert if one was raised.
    pub fn observe(
        &mut self,
        kind: AlertKind,
        device_id: u32,
        value: f64,
        threshold: Threshold,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let Some((severity, crossed)) = threshold.severity(value) else {
            self.firing.remove(&(kind, device_id));
            return None;
        };
        if !self.firing.insert((kind, device_id)) {
            return None;
        }

        let alert = Alert {
            kind,
            severity,
            device_id,
            message: describe(kind, device_id, value, crossed),
            timestamp: now,
            value,
            threshold: crossed,
        };
        tracing::warn!(
            kind = %kind,
            device_id,
            value,
            threshold = crossed,
            "GPU alert raised"
        );
        self.alerts.push(alert.clone());
        Some(alert)
    }

    /// Drop alerts older than `retention` and return the rest.
    pub fn active(&mut self, now: DateTime<Utc>, retention: Duration) -> Vec<Alert> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention);
        if let Some(cutoff) = cutoff {
            self.alerts.retain(|alert| alert.timestamp >= cutoff);
        }
        self.alerts.clone()
    }
}

fn describe(kind: AlertKind, device_id: u32, value: f64, threshold: f64) -> String {
    match kind {
        AlertKind::HighMemoryUsage => {
            format!("GPU {device_id} memory usage {value:.1}% exceeds {threshold:.1}%")
        }
        AlertKind::HighTemperature => {
            format!("GPU {device_id} temperature {value:.1}C exceeds {threshold:.1}C")
        }
        AlertKind::HighUtilization => {
            format!("GPU {device_id} utilization {value:.1}% exceeds {threshold:.1}%")
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const MEMORY: Threshold = Threshold {
        warning: 85.0,
        critical: 95.0,
    };

    #[test]
    fn raises_once_per_crossing() {
        let mut book = AlertBook::new();
        let now = Utc::now();
        assert!(book.observe(AlertKind::HighMemoryUsage, 0, 50.0, MEMORY, now).is_none());
        let alert = book
            .observe(AlertKind::HighMemoryUsage, 0, 90.0, MEMORY, now)
            .unwrap();
        assert_eq!(alert.severity, AlertSeverity::Warning);
        assert!(book.observe(AlertKind::HighMemoryUsage, 0, 97.0, MEMORY, now).is_none());
        assert!(book.observe(AlertKind::HighMemoryUsage, 1, 97.0, MEMORY, now).is_some());

        book.observe(AlertKind::HighMemoryUsage, 0, 10.0, MEMORY, now);
        let again = book
            .observe(AlertKind::HighMemoryUsage, 0, 96.0, MEMORY, now)
            .unwrap();
        assert_eq!(again.severity, AlertSeverity::Critical);
        assert_eq!(book.active(now, Duration::from_secs(60)).len(), 3);
    }

    #[test]
    fn prunes_after_retention() {
        let mut book = AlertBook::new();
        let start = DateTime::from_timestamp(1_000, 0).unwrap();
        book.observe(AlertKind::HighTemperature, 0, 85.0, MEMORY, start);
        let later = start + chrono::Duration::seconds(61);
        assert_eq!(book.active(later, Duration::from_secs(120)).len(), 1);
        assert!(book.active(later, Duration::from_secs(60)).is_empty());
    }
}
