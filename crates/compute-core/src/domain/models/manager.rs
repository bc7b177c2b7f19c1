use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use api_types::ComputeDevice;
use api_types::ModelInfo;
use api_types::OptimizationRecord;
use chrono::DateTime;
use chrono::Utc;
use influxdb_line_protocol::LineProtocolBuilder;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::cache::ModelCache;
use super::cache::ModelCacheEntry;
use super::config::ModelManagerConfig;
use super::loader::artifact_path;
use super::loader::ArtifactFetcher;
use super::loader::FileModelLoader;
use super::loader::ModelHandle;
use super::loader::ModelLoader;
use super::pressure::MemoryPressure;
use super::registry::ModelRegistry;
use crate::clock::SharedClock;
use crate::error::ComputeError;
use crate::error::Result;
use crate::memory::GpuMemoryManager;
use crate::metrics::current_time;
use crate::metrics::emit;

/// Where the caller wants a model placed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    /// GPU with the most free memory that fits, otherwise the CPU
    #[default]
    Auto,
    Gpu(u32),
    Cpu,
}

#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub handle: ModelHandle,
    pub model_info: ModelInfo,
    pub device: ComputeDevice,
    /// GPU memory held for the model, in MB; zero on the CPU
    pub memory_used: u64,
    pub load_time: Duration,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedModel {
    pub model_id: String,
    pub device: ComputeDevice,
    pub memory_used: u64,
    pub loaded_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelManagerStats {
    pub loaded_models: usize,
    pub cache_capacity: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub gpu_loads: u64,
    pub cpu_loads: u64,
    pub cpu_fallbacks: u64,
    pub downloads: u64,
    pub failed_loads: u64,
    pub total_load_secs: f64,
    pub average_load_secs: f64,
    pub gpu_memory_mb: u64,
}

/// Outcome of one [`ModelManager::handle_memory_pressure`] call.
#[derive(Debug, Clone, Serialize)]
pub struct PressureResponse {
    pub level: MemoryPressure,
    pub evicted: Vec<String>,
    pub cleanup: Option<OptimizationRecord>,
    pub memory_percent_before: f64,
    pub memory_percent_after: f64,
}

#[derive(Debug, Default)]
struct LoadCounters {
    cache_hits: u64,
    cache_misses: u64,
    evictions: u64,
    gpu_loads: u64,
    cpu_loads: u64,
    cpu_fallbacks: u64,
    downloads: u64,
    failed_loads: u64,
    total_load_secs: f64,
}

#[derive(Debug)]
struct Placement {
    device: ComputeDevice,
    allocation_id: Option<String>,
    fallback: bool,
}

/// Loads, caches and unloads models on top of the registry and the GPU
/// memory ledger.
///
/// The cache lock is held for the whole of a load, so concurrent requests for
/// the same model never load it twice and a failed load leaves neither a cache
/// entry nor a GPU allocation behind.
#[derive(Debug)]
pub struct ModelManager {
    config: ModelManagerConfig,
    registry: Mutex<ModelRegistry>,
    memory: Arc<GpuMemoryManager>,
    cache: tokio::sync::Mutex<ModelCache>,
    counters: Mutex<LoadCounters>,
    loader: Arc<dyn ModelLoader>,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
    clock: SharedClock,
}

impl ModelManager {
    pub fn new(
        config: ModelManagerConfig,
        registry: ModelRegistry,
        memory: Arc<GpuMemoryManager>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cache: tokio::sync::Mutex::new(ModelCache::new(config.max_cache_size)),
            registry: Mutex::new(registry),
            counters: Mutex::new(LoadCounters::default()),
            loader: Arc::new(FileModelLoader),
            fetcher: None,
            config,
            memory,
            clock,
        })
    }

    pub fn with_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn config(&self) -> &ModelManagerConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<GpuMemoryManager> {
        &self.memory
    }

    pub fn register_model(&self, info: ModelInfo) -> Result<()> {
        self.registry.lock().expect("poisoned").register(info)
    }

    pub fn model_info(&self, model_id: &str) -> Option<ModelInfo> {
        self.registry.lock().expect("poisoned").get(model_id).cloned()
    }

    pub fn registered_models(&self) -> Vec<ModelInfo> {
        self.registry
            .lock()
            .expect("poisoned")
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn load_model(&self, model_id: &str, request: DeviceRequest) -> Result<LoadedModel> {
        let started = Instant::now();
        let mut cache = self.cache.lock().await;
        let now = self.clock.now();

        if let Some(entry) = cache.touch(model_id, now) {
            let loaded = LoadedModel {
                handle: entry.handle.clone(),
                model_info: entry.model_info.clone(),
                device: entry.device,
                memory_used: entry.memory_used,
                load_time: started.elapsed(),
                cache_hit: true,
            };
            self.counters().cache_hits += 1;
            tracing::debug!(model_id, device = %loaded.device, "Model cache hit");
            return Ok(loaded);
        }

        let info = self
            .model_info(model_id)
            .ok_or_else(|| ComputeError::ModelNotFound {
                model_id: model_id.to_string(),
            })?;
        self.counters().cache_misses += 1;

        let target = match request {
            DeviceRequest::Auto => self.memory.get_optimal_device(info.gpu_memory_required),
            DeviceRequest::Gpu(index) => ComputeDevice::Gpu(index),
            DeviceRequest::Cpu => ComputeDevice::Cpu,
        };

        if cache.is_full() {
            if let Some(evicted) = cache.pop_lru() {
                self.evict(evicted, "cache full");
            }
        }

        let placement = match self.reserve(&info, target, request == DeviceRequest::Cpu) {
            Ok(placement) => placement,
            Err(e) => {
                self.counters().failed_loads += 1;
                return Err(e);
            }
        };

        let handle = match self.load_artifact(&info, placement.device).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(allocation_id) = &placement.allocation_id {
                    self.memory.release(allocation_id);
                }
                self.counters().failed_loads += 1;
                tracing::warn!(model_id, device = %placement.device, error = %e, "Model load failed");
                return Err(e);
            }
        };

        let memory_used = if placement.allocation_id.is_some() {
            info.gpu_memory_required
        } else {
            0
        };
        cache.insert(ModelCacheEntry::new(
            handle.clone(),
            info.clone(),
            placement.device,
            memory_used,
            placement.allocation_id,
            now,
        ));
        drop(cache);

        let load_time = started.elapsed();
        {
            let mut counters = self.counters();
            match placement.device {
                ComputeDevice::Gpu(_) => counters.gpu_loads += 1,
                ComputeDevice::Cpu => counters.cpu_loads += 1,
            }
            if placement.fallback {
                counters.cpu_fallbacks += 1;
            }
            counters.total_load_secs += load_time.as_secs_f64();
        }

        emit(
            LineProtocolBuilder::new()
                .measurement("compute_model_load")
                .tag("model_id", model_id)
                .tag("device", &placement.device.to_string())
                .field("load_secs", load_time.as_secs_f64())
                .field("memory_mb", memory_used)
                .field("fallback", placement.fallback)
                .timestamp(current_time())
                .close_line()
                .build(),
        );
        tracing::info!(
            model_id,
            device = %placement.device,
            memory_used,
            load_secs = load_time.as_secs_f64(),
            "Loaded model"
        );

        Ok(LoadedModel {
            handle,
            model_info: info,
            device: placement.device,
            memory_used,
            load_time,
            cache_hit: false,
        })
    }

    /// Drop a model from the cache. Returns `false` when it was not loaded.
    pub async fn unload_model(&self, model_id: &str) -> bool {
        let Some(entry) = self.cache.lock().await.remove(model_id) else {
            return false;
        };
        self.release(&entry);
        tracing::info!(model_id, device = %entry.device, "Unloaded model");
        true
    }

    pub async fn is_loaded(&self, model_id: &str) -> bool {
        self.cache.lock().await.contains(model_id)
    }

    /// Load each model in turn; one failure does not stop the rest.
    pub async fn preload_models(&self, model_ids: &[String]) -> Vec<(String, Result<LoadedModel>)> {
        let mut outcomes = Vec::with_capacity(model_ids.len());
        for model_id in model_ids {
            let outcome = self.load_model(model_id, DeviceRequest::Auto).await;
            if let Err(e) = &outcome {
                tracing::warn!(model_id = %model_id, error = %e, "Preload failed");
            }
            outcomes.push((model_id.clone(), outcome));
        }
        outcomes
    }

    /// Loaded models, most recently used first.
    pub async fn list_loaded_models(&self) -> Vec<CachedModel> {
        self.cache
            .lock()
            .await
            .entries_by_recency()
            .into_iter()
            .map(|entry| CachedModel {
                model_id: entry.model_info.model_id.clone(),
                device: entry.device,
                memory_used: entry.memory_used,
                loaded_at: entry.loaded_at,
                last_accessed: entry.last_accessed,
                access_count: entry.access_count,
            })
            .collect()
    }

    pub async fn get_stats(&self) -> ModelManagerStats {
        let cache = self.cache.lock().await;
        let counters = self.counters();
        let loads = counters.gpu_loads + counters.cpu_loads;
        ModelManagerStats {
            loaded_models: cache.len(),
            cache_capacity: cache.capacity(),
            cache_hits: counters.cache_hits,
            cache_misses: counters.cache_misses,
            evictions: counters.evictions,
            gpu_loads: counters.gpu_loads,
            cpu_loads: counters.cpu_loads,
            cpu_fallbacks: counters.cpu_fallbacks,
            downloads: counters.downloads,
            failed_loads: counters.failed_loads,
            total_load_secs: counters.total_load_secs,
            average_load_secs: if loads == 0 {
                0.0
            } else {
                counters.total_load_secs / loads as f64
            },
            gpu_memory_mb: cache
                .entries_by_recency()
                .iter()
                .map(|entry| entry.memory_used)
                .sum(),
        }
    }

    /// Current tier from aggregate GPU memory use.
    pub fn check_memory_pressure(&self) -> MemoryPressure {
        let status = self.memory.current_status();
        MemoryPressure::from_percent(status.memory_percent, &self.config.pressure)
    }

    /// Respond to `level`.
    ///
    /// * low: observe only
    /// * medium: evict the least recently used GPU model while above the medium target
    /// * high: evict GPU models until at the high target, then force a cleanup
    /// * critical: evict everything but the most recently used model, then force a cleanup
    pub async fn handle_memory_pressure(&self, level: MemoryPressure) -> PressureResponse {
        let mut cache = self.cache.lock().await;
        let thresholds = &self.config.pressure;
        let before = self.memory.current_status().memory_percent;
        let mut evicted = Vec::new();
        let mut cleanup = None;

        match level {
            MemoryPressure::Low => {
                tracing::debug!(memory_percent = before, "Memory pressure low");
            }
            MemoryPressure::Medium => {
                if before > thresholds.medium_target {
                    if let Some(entry) = cache.pop_lru_where(|e| e.allocation_id.is_some()) {
                        evicted.push(self.evict(entry, "medium memory pressure"));
                    }
                }
            }
            MemoryPressure::High => {
                while self.memory.current_status().memory_percent > thresholds.high_target {
                    let Some(entry) = cache.pop_lru_where(|e| e.allocation_id.is_some()) else {
                        break;
                    };
                    evicted.push(self.evict(entry, "high memory pressure"));
                }
                if !evicted.is_empty()
                    || self.memory.current_status().memory_percent > thresholds.high_target
                {
                    cleanup = self.memory.force_memory_cleanup();
                }
            }
            MemoryPressure::Critical => {
                while cache.len() > 1 {
                    let Some(entry) = cache.pop_lru() else {
                        break;
                    };
                    evicted.push(self.evict(entry, "critical memory pressure"));
                }
                if !evicted.is_empty()
                    || self.memory.current_status().memory_percent > thresholds.high_target
                {
                    cleanup = self.memory.force_memory_cleanup();
                }
            }
        }
        drop(cache);

        let after = self.memory.current_status().memory_percent;
        if level > MemoryPressure::Low {
            emit(
                LineProtocolBuilder::new()
                    .measurement("compute_memory_pressure")
                    .tag("level", &level.to_string())
                    .field("evicted", evicted.len() as u64)
                    .field("before_percent", before)
                    .field("after_percent", after)
                    .timestamp(current_time())
                    .close_line()
                    .build(),
            );
            tracing::info!(
                %level,
                evicted = evicted.len(),
                before_percent = before,
                after_percent = after,
                "Handled memory pressure"
            );
        }

        PressureResponse {
            level,
            evicted,
            cleanup,
            memory_percent_before: before,
            memory_percent_after: after,
        }
    }

    /// Check the tier and respond when it is above low.
    pub async fn relieve_memory_pressure(&self) -> Option<PressureResponse> {
        let level = self.check_memory_pressure();
        if level == MemoryPressure::Low {
            return None;
        }
        Some(self.handle_memory_pressure(level).await)
    }

    /// Sample GPU memory every `interval`, feeding history and alerts, and
    /// optionally respond to the resulting pressure tier.
    pub async fn run_memory_monitor(
        &self,
        interval: Duration,
        auto_relief: bool,
        cancellation_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::info!("Memory monitor shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    let status = self.memory.get_status();
                    tracing::debug!(
                        memory_percent = status.memory_percent,
                        allocated_mb = status.allocated_mb,
                        active_allocations = status.active_allocations,
                        "Sampled GPU memory"
                    );
                    if auto_relief {
                        self.relieve_memory_pressure().await;
                    }
                }
            }
        }
    }

    /// Unload everything and return the number of models released.
    pub async fn shutdown(&self) -> usize {
        let entries = self.cache.lock().await.drain();
        for entry in &entries {
            self.release(entry);
        }
        tracing::info!(released = entries.len(), "Model manager shut down");
        entries.len()
    }

    fn counters(&self) -> MutexGuard<'_, LoadCounters> {
        self.counters.lock().expect("poisoned")
    }

    fn release(&self, entry: &ModelCacheEntry) {
        if let Some(allocation_id) = &entry.allocation_id {
            self.memory.release(allocation_id);
        }
    }

    fn evict(&self, entry: ModelCacheEntry, reason: &str) -> String {
        self.release(&entry);
        self.counters().evictions += 1;
        tracing::info!(
            model_id = %entry.model_info.model_id,
            device = %entry.device,
            memory_used = entry.memory_used,
            reason,
            "Evicted model"
        );
        entry.model_info.model_id
    }

    fn reserve(&self, info: &ModelInfo, target: ComputeDevice, cpu_requested: bool) -> Result<Placement> {
        let required = info.gpu_memory_required;
        let shortfall = match target {
            ComputeDevice::Cpu if cpu_requested => {
                return Ok(Placement {
                    device: ComputeDevice::Cpu,
                    allocation_id: None,
                    fallback: false,
                });
            }
            ComputeDevice::Cpu => ComputeError::Capacity {
                device: "any device".to_string(),
                requested_mb: required,
                available_mb: self
                    .memory
                    .current_status()
                    .devices
                    .iter()
                    .map(|d| d.available_mb)
                    .max()
                    .unwrap_or(0),
            },
            ComputeDevice::Gpu(index) => {
                match self.memory.allocate(&info.model_id, index, required) {
                    Ok(allocation_id) => {
                        return Ok(Placement {
                            device: target,
                            allocation_id: Some(allocation_id),
                            fallback: false,
                        });
                    }
                    Err(e @ ComputeError::Capacity { .. }) => e,
                    Err(e) => return Err(e),
                }
            }
        };

        if !self.config.enable_cpu_fallback {
            return Err(shortfall);
        }
        tracing::warn!(
            model_id = %info.model_id,
            requested_mb = required,
            reason = %shortfall,
            "Falling back to CPU"
        );
        Ok(Placement {
            device: ComputeDevice::Cpu,
            allocation_id: None,
            fallback: true,
        })
    }

    async fn load_artifact(&self, info: &ModelInfo, device: ComputeDevice) -> Result<ModelHandle> {
        let path = artifact_path(info, &self.config.models_dir);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            self.stage_download(info, &path).await?;
        }
        self.loader.load(info, &path, device).await
    }

    async fn stage_download(&self, info: &ModelInfo, path: &Path) -> Result<()> {
        let unavailable = |message: String| ComputeError::ArtifactUnavailable {
            model_id: info.model_id.clone(),
            message,
        };
        let Some(url) = info.download_url.as_deref() else {
            return Err(unavailable(format!(
                "no artifact at {} and no download url",
                path.display()
            )));
        };
        if !self.config.enable_download {
            return Err(unavailable(format!(
                "no artifact at {} and downloads are disabled",
                path.display()
            )));
        }
        let Some(fetcher) = &self.fetcher else {
            return Err(unavailable("no artifact fetcher configured".to_string()));
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match fetcher.fetch(url, path).await {
                Ok(bytes) => {
                    self.counters().downloads += 1;
                    tracing::info!(
                        model_id = %info.model_id,
                        url,
                        bytes,
                        path = %path.display(),
                        "Staged model artifact"
                    );
                    return Ok(());
                }
                Err(e) if attempt < self.config.download_attempts => {
                    tracing::warn!(
                        model_id = %info.model_id,
                        url,
                        attempt,
                        error = %e,
                        "Artifact download failed, retrying"
                    );
                    tokio::time::sleep(self.config.download_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use api_types::ModelType;
    use async_trait::async_trait;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::clock::ManualClock;
    use crate::devices::DeviceSpec;
    use crate::memory::MemoryConfig;

    fn info(model_id: &str, memory_mb: u64) -> ModelInfo {
        ModelInfo {
            model_id: model_id.to_string(),
            model_type: ModelType::Generic,
            version: "1".to_string(),
            size_mb: 1.0,
            gpu_memory_required: memory_mb,
            supported_operations: Vec::new(),
            performance_characteristics: BTreeMap::new(),
            file_path: None,
            download_url: None,
            checksum: None,
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        manager: ModelManager,
        memory: Arc<GpuMemoryManager>,
    }

    fn fixture(models: &[(&str, u64)], config: ModelManagerConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ModelRegistry::new();
        for (model_id, memory_mb) in models {
            std::fs::write(dir.path().join(format!("{model_id}.bin")), b"weights").unwrap();
            registry.register(info(model_id, *memory_mb)).unwrap();
        }
        let clock: SharedClock = Arc::new(ManualClock::default());
        let memory = Arc::new(
            GpuMemoryManager::new(
                &[DeviceSpec {
                    id: 0,
                    name: "sim-0".to_string(),
                    memory_mb: 1000,
                }],
                MemoryConfig {
                    fragmentation_ratio: 0.0,
                    ..MemoryConfig::default()
                },
                clock.clone(),
            )
            .unwrap(),
        );
        let config = ModelManagerConfig {
            models_dir: dir.path().to_path_buf(),
            ..config
        };
        let manager = ModelManager::new(config, registry, memory.clone(), clock).unwrap();
        Fixture {
            dir,
            manager,
            memory,
        }
    }

    #[tokio::test]
    async fn second_load_is_a_cache_hit() {
        let f = fixture(&[("a", 100)], ModelManagerConfig::default());
        let first = f.manager.load_model("a", DeviceRequest::Auto).await.unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.device, ComputeDevice::Gpu(0));
        assert_eq!(first.memory_used, 100);

        let second = f.manager.load_model("a", DeviceRequest::Auto).await.unwrap();
        assert!(second.cache_hit);
        assert!(Arc::ptr_eq(&first.handle, &second.handle));

        let stats = f.manager.get_stats().await;
        assert_eq!((stats.cache_hits, stats.cache_misses), (1, 1));
        assert_eq!(stats.gpu_memory_mb, 100);
        assert_eq!(f.memory.allocation_count(), 1);
    }

    #[tokio::test]
    async fn oversize_model_falls_back_to_cpu() {
        let f = fixture(&[("big", 5000)], ModelManagerConfig::default());
        let loaded = f.manager.load_model("big", DeviceRequest::Gpu(0)).await.unwrap();
        assert_eq!(loaded.device, ComputeDevice::Cpu);
        assert_eq!(loaded.memory_used, 0);
        assert_eq!(f.manager.get_stats().await.cpu_fallbacks, 1);
        assert_eq!(f.memory.allocation_count(), 0);
    }

    #[tokio::test]
    async fn oversize_model_fails_without_fallback() {
        let f = fixture(
            &[("big", 5000)],
            ModelManagerConfig {
                enable_cpu_fallback: false,
                ..ModelManagerConfig::default()
            },
        );
        let err = f.manager.load_model("big", DeviceRequest::Auto).await.unwrap_err();
        assert!(matches!(err, ComputeError::Capacity { .. }));
        assert!(!f.manager.is_loaded("big").await);
    }

    #[tokio::test]
    async fn failed_artifact_load_releases_memory() {
        let f = fixture(&[("a", 100)], ModelManagerConfig::default());
        f.manager.register_model(info("ghost", 200)).unwrap();

        let err = f.manager.load_model("ghost", DeviceRequest::Auto).await.unwrap_err();
        assert!(matches!(err, ComputeError::ArtifactUnavailable { .. }));
        assert!(!f.manager.is_loaded("ghost").await);
        assert_eq!(f.memory.allocation_count(), 0);
        assert_eq!(f.memory.current_status().allocated_mb, 0);
        assert_eq!(f.manager.get_stats().await.failed_loads, 1);
    }

    #[tokio::test]
    async fn unload_is_idempotent() {
        let f = fixture(&[("a", 100)], ModelManagerConfig::default());
        f.manager.load_model("a", DeviceRequest::Auto).await.unwrap();
        assert!(f.manager.unload_model("a").await);
        assert!(!f.manager.unload_model("a").await);
        assert_eq!(f.memory.current_status().allocated_mb, 0);
    }

    #[tokio::test]
    async fn medium_pressure_evicts_one_gpu_model() {
        let f = fixture(
            &[("a", 300), ("b", 300), ("c", 300)],
            ModelManagerConfig::default(),
        );
        for model_id in ["a", "b", "c"] {
            f.manager.load_model(model_id, DeviceRequest::Auto).await.unwrap();
        }
        assert_eq!(f.manager.check_memory_pressure(), MemoryPressure::High);

        let response = f.manager.handle_memory_pressure(MemoryPressure::Medium).await;
        assert_eq!(response.evicted, vec!["a".to_string()]);
        assert_eq!(response.memory_percent_after, 60.0);

        let again = f.manager.handle_memory_pressure(MemoryPressure::Medium).await;
        assert!(again.evicted.is_empty());
    }

    #[tokio::test]
    async fn critical_pressure_keeps_most_recent() {
        let f = fixture(
            &[("a", 300), ("b", 300), ("c", 300)],
            ModelManagerConfig::default(),
        );
        for model_id in ["a", "b", "c"] {
            f.manager.load_model(model_id, DeviceRequest::Auto).await.unwrap();
        }
        f.manager.load_model("a", DeviceRequest::Auto).await.unwrap();

        let response = f.manager.handle_memory_pressure(MemoryPressure::Critical).await;
        assert_eq!(response.evicted, vec!["b".to_string(), "c".to_string()]);
        let loaded: Vec<_> = f
            .manager
            .list_loaded_models()
            .await
            .into_iter()
            .map(|m| m.model_id)
            .collect();
        assert_eq!(loaded, vec!["a".to_string()]);

        let again = f.manager.handle_memory_pressure(MemoryPressure::Critical).await;
        assert!(again.evicted.is_empty());
    }

    #[derive(Debug)]
    struct FlakyFetcher {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ArtifactFetcher for FlakyFetcher {
        async fn fetch(&self, url: &str, destination: &Path) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(ComputeError::Download {
                    url: url.to_string(),
                    message: "connection reset".to_string(),
                });
            }
            std::fs::write(destination, b"weights").map_err(|e| ComputeError::io(destination, e))?;
            Ok(7)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_artifact_is_downloaded_with_retry() {
        let fetcher = Arc::new(FlakyFetcher {
            failures_left: AtomicU32::new(1),
            calls: AtomicU32::new(0),
        });
        let f = fixture(&[], ModelManagerConfig::default());
        let manager = f.manager.with_fetcher(fetcher.clone());
        let mut remote = info("remote", 100);
        remote.download_url = Some("http://models.invalid/remote.bin".to_string());
        manager.register_model(remote).unwrap();

        let loaded = manager.load_model("remote", DeviceRequest::Auto).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            loaded.handle.path.as_deref(),
            Some(f.dir.path().join("remote.bin").as_path())
        );
        assert_eq!(manager.get_stats().await.downloads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_monitor_samples_and_relieves() {
        let f = fixture(
            &[("a", 300), ("b", 300), ("c", 300)],
            ModelManagerConfig::default(),
        );
        for model_id in ["a", "b", "c"] {
            f.manager.load_model(model_id, DeviceRequest::Auto).await.unwrap();
        }
        let manager = Arc::new(f.manager);
        let token = CancellationToken::new();
        let monitor = tokio::spawn({
            let manager = manager.clone();
            let token = token.clone();
            async move {
                manager
                    .run_memory_monitor(Duration::from_secs(5), true, token)
                    .await
            }
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        token.cancel();
        monitor.await.unwrap();

        assert_eq!(f.memory.history().len(), 1);
        assert_eq!(manager.check_memory_pressure(), MemoryPressure::Low);
        assert_eq!(manager.list_loaded_models().await.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let f = fixture(&[("a", 100), ("b", 100)], ModelManagerConfig::default());
        f.manager.load_model("a", DeviceRequest::Auto).await.unwrap();
        f.manager.load_model("b", DeviceRequest::Cpu).await.unwrap();
        assert_eq!(f.manager.shutdown().await, 2);
        assert_eq!(f.memory.allocation_count(), 0);
        assert!(f.manager.list_loaded_models().await.is_empty());
    }
}
