use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use api_types::Alert;
use api_types::AlertKind;
use api_types::ComputeDevice;
use api_types::DeviceMemoryStatus;
use api_types::GpuMemoryStatus;
use api_types::GpuMonitoringReport;
use api_types::MemoryPrediction;
use api_types::MemoryTrends;
use api_types::OptimizationRecord;
use chrono::DateTime;
use chrono::Utc;
use influxdb_line_protocol::LineProtocolBuilder;

use super::alerts::AlertBook;
use super::alerts::Threshold;
use super::config::MemoryConfig;
use super::prediction;
use super::prediction::MemorySample;
use crate::clock::seconds_between;
use crate::clock::SharedClock;
use crate::devices::DeviceSpec;
use crate::devices::Telemetry;
use crate::error::ComputeError;
use crate::error::Result;
use crate::metrics::current_time;
use crate::metrics::emit;
use crate::scheduler::Band;

/// Memory percent band treated as healthy by [`GpuMemoryManager::optimization_score`].
const HEALTHY_MEMORY: Band = Band::new(40.0, 80.0);
const HEALTHY_MEMORY_SIGMA: f64 = 20.0;

#[derive(Debug, Clone)]
struct DeviceLedger {
    name: String,
    total_mb: u64,
    allocated_mb: u64,
    fragmented_mb: u64,
    active_allocations: usize,
}

impl DeviceLedger {
    fn available_mb(&self) -> u64 {
        self.total_mb
            .saturating_sub(self.allocated_mb + self.fragmented_mb)
    }

    fn memory_percent(&self) -> f64 {
        percent(self.allocated_mb + self.fragmented_mb, self.total_mb)
    }

    fn utilization_percent(&self) -> f64 {
        percent(self.allocated_mb, self.total_mb)
    }
}

#[derive(Debug, Clone)]
struct Allocation {
    device_id: u32,
    size_mb: u64,
    owner: String,
}

#[derive(Debug)]
struct MemoryState {
    devices: BTreeMap<u32, DeviceLedger>,
    allocations: HashMap<String, Allocation>,
    history: VecDeque<MemorySample>,
    alerts: AlertBook,
    optimization_history: VecDeque<OptimizationRecord>,
    last_cleanup: Option<DateTime<Utc>>,
    next_allocation: u64,
}

/// Bookkeeping of GPU memory handed out to models.
///
/// `allocated + fragmented + available == total` holds for every device.
/// Released memory leaves a configurable share behind as fragmentation until
/// [`GpuMemoryManager::force_memory_cleanup`] reclaims it.
#[derive(Debug)]
pub struct GpuMemoryManager {
    config: MemoryConfig,
    clock: SharedClock,
    telemetry: Telemetry,
    state: Mutex<MemoryState>,
}

impl GpuMemoryManager {
    pub fn new(devices: &[DeviceSpec], config: MemoryConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        let mut ledgers = BTreeMap::new();
        for spec in devices {
            let ledger = DeviceLedger {
                name: spec.name.clone(),
                total_mb: spec.memory_mb,
                allocated_mb: 0,
                fragmented_mb: 0,
                active_allocations: 0,
            };
            if ledgers.insert(spec.id, ledger).is_some() {
                return Err(ComputeError::config(format!(
                    "device id {} is listed twice",
                    spec.id
                )));
            }
        }

        Ok(Self {
            telemetry: Telemetry::new(config.telemetry_seed, config.telemetry_jitter),
            state: Mutex::new(MemoryState {
                devices: ledgers,
                allocations: HashMap::new(),
                history: VecDeque::with_capacity(config.history_size),
                alerts: AlertBook::new(),
                optimization_history: VecDeque::new(),
                last_cleanup: None,
                next_allocation: 0,
            }),
            config,
            clock,
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Reserve `size_mb` on `device_id` for `owner`; returns the allocation id.
    pub fn allocate(&self, owner: &str, device_id: u32, size_mb: u64) -> Result<String> {
        let mut state = self.state.lock().expect("poisoned");
        let ledger = state
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| ComputeError::config(format!("unknown GPU device {device_id}")))?;
        let available = ledger.available_mb();
        if available < size_mb {
            return Err(ComputeError::Capacity {
                device: ComputeDevice::Gpu(device_id).to_string(),
                requested_mb: size_mb,
                available_mb: available,
            });
        }
        ledger.allocated_mb += size_mb;
        ledger.active_allocations += 1;

        state.next_allocation += 1;
        let allocation_id = format!("alloc-{}", state.next_allocation);
        state.allocations.insert(
            allocation_id.clone(),
            Allocation {
                device_id,
                size_mb,
                owner: owner.to_string(),
            },
        );

        tracing::debug!(
            allocation_id = %allocation_id,
            owner,
            device_id,
            size_mb,
            "Allocated GPU memory"
        );
        Ok(allocation_id)
    }

    /// Return an allocation. Unknown ids are ignored and yield `false`.
    pub fn release(&self, allocation_id: &str) -> bool {
        let mut state = self.state.lock().expect("poisoned");
        let Some(allocation) = state.allocations.remove(allocation_id) else {
            return false;
        };
        if let Some(ledger) = state.devices.get_mut(&allocation.device_id) {
            ledger.allocated_mb = ledger.allocated_mb.saturating_sub(allocation.size_mb);
            ledger.active_allocations = ledger.active_allocations.saturating_sub(1);
            let leftover = (allocation.size_mb as f64 * self.config.fragmentation_ratio).round() as u64;
            let room = ledger.total_mb - ledger.allocated_mb - ledger.fragmented_mb;
            ledger.fragmented_mb += leftover.min(room);
        }
        tracing::debug!(
            allocation_id,
            owner = %allocation.owner,
            device_id = allocation.device_id,
            size_mb = allocation.size_mb,
            "Released GPU memory"
        );
        true
    }

    pub fn allocation_count(&self) -> usize {
        self.state.lock().expect("poisoned").allocations.len()
    }

    /// GPU with the most free memory that fits `required_mb`, else the CPU.
    pub fn get_optimal_device(&self, required_mb: u64) -> ComputeDevice {
        let state = self.state.lock().expect("poisoned");
        let mut best: Option<(u32, u64)> = None;
        for (device_id, ledger) in &state.devices {
            let available = ledger.available_mb();
            if available < required_mb {
                continue;
            }
            if best.map_or(true, |(_, best_available)| available > best_available) {
                best = Some((*device_id, available));
            }
        }
        best.map_or(ComputeDevice::Cpu, |(device_id, _)| ComputeDevice::Gpu(device_id))
    }

    /// Snapshot without touching history or alerts.
    pub fn current_status(&self) -> GpuMemoryStatus {
        let state = self.state.lock().expect("poisoned");
        self.snapshot(&state, self.clock.now())
    }

    /// Snapshot that is also appended to the history and checked against
    /// alert thresholds.
    pub fn get_status(&self) -> GpuMemoryStatus {
        let now = self.clock.now();
        let mut state = self.state.lock().expect("poisoned");
        let status = self.snapshot(&state, now);

        if state.history.len() >= self.config.history_size {
            state.history.pop_front();
        }
        state.history.push_back(MemorySample {
            timestamp: now,
            memory_percent: status.memory_percent,
            utilization_percent: status.utilization_percent,
            temperature: status.temperature,
            available_mb: status.available_mb,
            active_allocations: status.active_allocations,
        });

        let memory = Threshold {
            warning: self.config.memory_alert_percent,
            critical: self.config.memory_critical_percent,
        };
        let temperature = Threshold {
            warning: self.config.temperature_alert,
            critical: self.config.temperature_critical,
        };
        let utilization = Threshold {
            warning: self.config.utilization_alert_percent,
            critical: f64::INFINITY,
        };
        for device in &status.devices {
            let checks = [
                (AlertKind::HighMemoryUsage, device.memory_percent, memory),
                (AlertKind::HighTemperature, device.temperature, temperature),
                (AlertKind::HighUtilization, device.utilization_percent, utilization),
            ];
            for (kind, value, threshold) in checks {
                if let Some(alert) = state
                    .alerts
                    .observe(kind, device.device_id, value, threshold, now)
                {
                    emit(
                        LineProtocolBuilder::new()
                            .measurement("compute_alert")
                            .tag("kind", &alert.kind.to_string())
                            .tag("device", &alert.device_id.to_string())
                            .field("value", alert.value)
                            .field("threshold", alert.threshold)
                            .timestamp(current_time())
                            .close_line()
                            .build(),
                    );
                }
            }
        }

        status
    }

    /// Alerts younger than the retention window; older ones are dropped.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let now = self.clock.now();
        self.state
            .lock()
            .expect("poisoned")
            .alerts
            .active(now, self.config.alert_retention)
    }

    pub fn history(&self) -> Vec<MemorySample> {
        self.state
            .lock()
            .expect("poisoned")
            .history
            .iter()
            .cloned()
            .collect()
    }

    pub fn get_memory_trends(&self) -> Option<MemoryTrends> {
        let state = self.state.lock().expect("poisoned");
        prediction::trends(state.history.iter())
    }

    pub fn predict_memory_exhaustion(&self) -> Option<MemoryPrediction> {
        let state = self.state.lock().expect("poisoned");
        let samples: Vec<_> = state.history.iter().collect();
        prediction::predict(
            &samples,
            self.config.prediction_window,
            self.config.exhaustion_percent,
        )
    }

    /// Reclaim part of the fragmentation on every device.
    ///
    /// Returns `None` while the cooldown since the previous cleanup is running.
    pub fn force_memory_cleanup(&self) -> Option<OptimizationRecord> {
        let now = self.clock.now();
        let mut state = self.state.lock().expect("poisoned");
        if let Some(last) = state.last_cleanup {
            if seconds_between(last, now) < self.config.cleanup_cooldown.as_secs_f64() {
                tracing::debug!("Memory cleanup skipped, cooldown active");
                return None;
            }
        }

        let before_percent = aggregate_memory_percent(&state.devices);
        let mut freed_mb = 0;
        for ledger in state.devices.values_mut() {
            let reclaimed =
                (ledger.fragmented_mb as f64 * self.config.defragmentation_ratio).round() as u64;
            let reclaimed = reclaimed.min(ledger.fragmented_mb);
            ledger.fragmented_mb -= reclaimed;
            freed_mb += reclaimed;
        }
        let after_percent = aggregate_memory_percent(&state.devices);

        let record = OptimizationRecord {
            timestamp: now,
            before_percent,
            after_percent,
            freed_mb,
        };
        if state.optimization_history.len() >= self.config.optimization_history_size {
            state.optimization_history.pop_front();
        }
        state.optimization_history.push_back(record.clone());
        state.last_cleanup = Some(now);

        tracing::info!(
            freed_mb,
            before_percent,
            after_percent,
            "Forced GPU memory cleanup"
        );
        Some(record)
    }

    pub fn optimization_history(&self) -> Vec<OptimizationRecord> {
        self.state
            .lock()
            .expect("poisoned")
            .optimization_history
            .iter()
            .cloned()
            .collect()
    }

    /// Health of the memory layout in `[0, 1]`, blending headroom,
    /// fragmentation and balance across devices.
    pub fn optimization_score(&self) -> f64 {
        let state = self.state.lock().expect("poisoned");
        if state.devices.is_empty() {
            return 1.0;
        }
        let total: u64 = state.devices.values().map(|d| d.total_mb).sum();
        let used: u64 = state
            .devices
            .values()
            .map(|d| d.allocated_mb + d.fragmented_mb)
            .sum();
        let fragmented: u64 = state.devices.values().map(|d| d.fragmented_mb).sum();

        let headroom = HEALTHY_MEMORY.fitness(aggregate_memory_percent(&state.devices), HEALTHY_MEMORY_SIGMA);
        let compaction = if used == 0 {
            1.0
        } else {
            1.0 - fragmented as f64 / used as f64
        };
        let percents: Vec<f64> = state.devices.values().map(DeviceLedger::memory_percent).collect();
        let mean = percents.iter().sum::<f64>() / percents.len() as f64;
        let spread = (percents.iter().map(|p| (p - mean).powi(2)).sum::<f64>()
            / percents.len() as f64)
            .sqrt();
        let balance = 1.0 - (spread / 100.0).min(1.0);

        let score = 0.4 * headroom + 0.3 * compaction + 0.3 * balance;
        tracing::trace!(total, score, "Computed memory optimization score");
        score.clamp(0.0, 1.0)
    }

    pub fn get_gpu_monitoring_report(&self) -> GpuMonitoringReport {
        let gpu_status = self.get_status();
        GpuMonitoringReport {
            gpu_status,
            memory_trends: self.get_memory_trends(),
            active_alerts: self.active_alerts(),
            optimization_history: self.optimization_history(),
            memory_prediction: self.predict_memory_exhaustion(),
        }
    }

    fn snapshot(&self, state: &MemoryState, now: DateTime<Utc>) -> GpuMemoryStatus {
        let devices: Vec<DeviceMemoryStatus> = state
            .devices
            .iter()
            .map(|(device_id, ledger)| {
                let utilization_percent = ledger.utilization_percent();
                DeviceMemoryStatus {
                    device_id: *device_id,
                    name: ledger.name.clone(),
                    total_mb: ledger.total_mb,
                    allocated_mb: ledger.allocated_mb,
                    fragmented_mb: ledger.fragmented_mb,
                    available_mb: ledger.available_mb(),
                    memory_percent: ledger.memory_percent(),
                    utilization_percent,
                    temperature: self.telemetry.temperature_for(utilization_percent),
                    active_allocations: ledger.active_allocations,
                }
            })
            .collect();

        let total_mb: u64 = devices.iter().map(|d| d.total_mb).sum();
        let allocated_mb: u64 = devices.iter().map(|d| d.allocated_mb).sum();
        let available_mb: u64 = devices.iter().map(|d| d.available_mb).sum();
        let temperature = devices
            .iter()
            .map(|d| d.temperature)
            .fold(0.0, f64::max);

        GpuMemoryStatus {
            timestamp: now,
            total_mb,
            allocated_mb,
            available_mb,
            memory_percent: percent(total_mb - available_mb, total_mb),
            utilization_percent: percent(allocated_mb, total_mb),
            temperature,
            active_allocations: state.allocations.len(),
            devices,
        }
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn aggregate_memory_percent(devices: &BTreeMap<u32, DeviceLedger>) -> f64 {
    let total: u64 = devices.values().map(|d| d.total_mb).sum();
    let used: u64 = devices
        .values()
        .map(|d| d.allocated_mb + d.fragmented_mb)
        .sum();
    percent(used, total)
}
