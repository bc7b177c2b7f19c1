//! GPU device bookkeeping shared by the scheduler.

use std::sync::Mutex;
use std::sync::PoisonError;

use api_types::DeviceMetrics;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ComputeError;
use crate::error::Result;

/// Idle temperature every device settles back to.
const BASE_TEMPERATURE: f64 = 40.0;
/// Degrees gained per utilization percentage point.
const TEMPERATURE_PER_UTIL: f64 = 0.45;

/// Static description of a device, as read from the inventory file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    pub id: u32,
    pub name: String,
    pub memory_mb: u64,
}

#[derive(Debug, Clone)]
pub struct GpuDevice {
    pub device_id: u32,
    pub name: String,
    pub total_memory_mb: u64,
    available_memory_mb: u64,
    pub utilization_percent: f64,
    pub temperature: f64,
    pub is_available: bool,
    pub current_job: Option<String>,
}

impl GpuDevice {
    pub fn new(device_id: u32, name: impl Into<String>, total_memory_mb: u64) -> Self {
        Self {
            device_id,
            name: name.into(),
            total_memory_mb,
            available_memory_mb: total_memory_mb,
            utilization_percent: 0.0,
            temperature: BASE_TEMPERATURE,
            is_available: true,
            current_job: None,
        }
    }

    pub fn available_memory_mb(&self) -> u64 {
        self.available_memory_mb
    }

    pub fn allocated_mb(&self) -> u64 {
        self.total_memory_mb - self.available_memory_mb
    }

    pub fn is_idle(&self) -> bool {
        self.is_available && self.current_job.is_none()
    }

    /// Whether the device could ever host `required_mb`, ignoring current load.
    pub fn could_host(&self, required_mb: u64) -> bool {
        self.is_available && self.total_memory_mb >= required_mb
    }

    pub fn can_host(&self, required_mb: u64) -> bool {
        self.is_idle() && self.available_memory_mb >= required_mb
    }

    /// Bind `job_id` to this device and reserve its memory.
    pub fn occupy(&mut self, job_id: &str, required_mb: u64) -> Result<()> {
        if !self.can_host(required_mb) {
            return Err(ComputeError::Capacity {
                device: format!("cuda:{}", self.device_id),
                requested_mb: required_mb,
                available_mb: if self.is_idle() {
                    self.available_memory_mb
                } else {
                    0
                },
            });
        }
        self.available_memory_mb -= required_mb;
        self.current_job = Some(job_id.to_string());
        Ok(())
    }

    /// Undo [`GpuDevice::occupy`]. A mismatched job id is ignored.
    pub fn vacate(&mut self, job_id: &str, reserved_mb: u64) -> bool {
        if self.current_job.as_deref() != Some(job_id) {
            return false;
        }
        self.available_memory_mb = (self.available_memory_mb + reserved_mb).min(self.total_memory_mb);
        self.current_job = None;
        true
    }

    pub fn to_metrics(&self) -> DeviceMetrics {
        DeviceMetrics {
            device_id: self.device_id,
            name: self.name.clone(),
            total_memory_mb: self.total_memory_mb,
            available_memory_mb: self.available_memory_mb,
            utilization_percent: self.utilization_percent,
            temperature: self.temperature,
            is_available: self.is_available,
            current_job: self.current_job.clone(),
        }
    }
}

impl From<&DeviceSpec> for GpuDevice {
    fn from(spec: &DeviceSpec) -> Self {
        GpuDevice::new(spec.id, spec.name.clone(), spec.memory_mb)
    }
}

/// Simulated telemetry: temperature follows utilization plus bounded noise.
#[derive(Debug)]
pub struct Telemetry {
    rng: Mutex<SmallRng>,
    jitter: f64,
}

impl Telemetry {
    /// `seed = None` draws from OS entropy.
    pub fn new(seed: Option<u64>, jitter: f64) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            jitter: jitter.abs(),
        }
    }

    pub fn temperature_for(&self, utilization_percent: f64) -> f64 {
        let noise = if self.jitter > 0.0 {
            self.rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        BASE_TEMPERATURE + utilization_percent.clamp(0.0, 100.0) * TEMPERATURE_PER_UTIL + noise
    }

    /// Shift utilization by `delta` points and recompute temperature.
    pub fn apply(&self, device: &mut GpuDevice, delta: f64) {
        device.utilization_percent = (device.utilization_percent + delta).clamp(0.0, 100.0);
        device.temperature = self.temperature_for(device.utilization_percent);
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn occupy_and_vacate_restore_memory() {
        let mut device = GpuDevice::new(0, "sim", 8192);
        device.occupy("job-1", 3000).unwrap();
        assert_eq!(device.available_memory_mb(), 5192);
        assert_eq!(device.allocated_mb(), 3000);
        assert!(!device.is_idle());

        let err = device.occupy("job-2", 100).unwrap_err();
        assert!(matches!(err, ComputeError::Capacity { available_mb: 0, .. }));

        assert!(!device.vacate("job-2", 3000));
        assert!(device.vacate("job-1", 3000));
        assert_eq!(device.available_memory_mb(), 8192);
        assert!(device.is_idle());
    }

    #[test]
    fn oversize_request_is_never_hostable() {
        let device = GpuDevice::new(0, "sim", 4096);
        assert!(!device.could_host(8192));
        assert!(device.could_host(4096));
    }

    #[test]
    fn temperature_tracks_utilization_without_jitter() {
        let telemetry = Telemetry::new(Some(7), 0.0);
        let mut device = GpuDevice::new(0, "sim", 1024);
        telemetry.apply(&mut device, 40.0);
        assert_eq!(device.utilization_percent, 40.0);
        assert_eq!(device.temperature, 58.0);
        telemetry.apply(&mut device, -80.0);
        assert_eq!(device.utilization_percent, 0.0);
    }

    #[test]
    fn seeded_jitter_is_reproducible_and_bounded() {
        let a = Telemetry::new(Some(42), 3.0);
        let b = Telemetry::new(Some(42), 3.0);
        for _ in 0..16 {
            let (ta, tb) = (a.temperature_for(50.0), b.temperature_for(50.0));
            assert_eq!(ta, tb);
            assert!((ta - 62.5).abs() <= 3.0);
        }
    }

    #[test]
    fn poisoned_rng_still_yields_readings() {
        let telemetry = Telemetry::new(Some(7), 3.0);
        let poisoned = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = telemetry.rng.lock().unwrap();
                    panic!("panic while holding the telemetry lock");
                })
                .join()
                .is_err()
        });
        assert!(poisoned);
        assert!(telemetry.rng.is_poisoned());

        let reading = telemetry.temperature_for(0.0);
        assert!((reading - BASE_TEMPERATURE).abs() <= 3.0);
    }
}
