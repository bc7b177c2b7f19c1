use std::sync::Arc;

use anyhow::Context as _;
use anyhow::Result;

use crate::app::Application;
use crate::app::ApplicationServices;
use crate::artifacts::HttpArtifactFetcher;
use crate::clock::SharedClock;
use crate::clock::SystemClock;
use crate::config::load_devices;
use crate::config::load_scheduling_file;
use crate::config::DaemonArgs;
use crate::config::SchedulingFile;
use crate::devices::DeviceSpec;
use crate::devices::GpuDevice;
use crate::memory::GpuMemoryManager;
use crate::models::ModelManager;
use crate::models::ModelManagerConfig;
use crate::models::ModelRegistry;
use crate::scheduler::GpuJobScheduler;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
    clock: SharedClock,
}

impl ApplicationBuilder {
    /// Create new application builder
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self {
            daemon_args,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the wall clock, e.g. with a manual one in tests
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Build complete application
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let devices = load_devices(self.daemon_args.devices_file.as_deref()).await?;
        let scheduling = load_scheduling_file(self.daemon_args.scheduling_config.as_deref()).await?;

        let memory = self.create_memory_manager(&devices, &scheduling)?;
        let scheduler = self.create_scheduler(&devices, &scheduling)?;
        let models = self.create_model_manager(&scheduling, memory.clone())?;

        let services = ApplicationServices {
            scheduler,
            memory,
            models,
        };

        Ok(Application::new(services, self.daemon_args))
    }

    fn create_memory_manager(
        &self,
        devices: &[DeviceSpec],
        scheduling: &SchedulingFile,
    ) -> Result<Arc<GpuMemoryManager>> {
        let config = scheduling.memory_config()?;
        let memory = GpuMemoryManager::new(devices, config, self.clock.clone())?;
        Ok(Arc::new(memory))
    }

    fn create_scheduler(
        &self,
        devices: &[DeviceSpec],
        scheduling: &SchedulingFile,
    ) -> Result<GpuJobScheduler> {
        let config = scheduling.scheduler_config()?;
        let devices = devices.iter().map(GpuDevice::from).collect();
        Ok(GpuJobScheduler::new(devices, config, self.clock.clone())?)
    }

    fn create_model_manager(
        &self,
        scheduling: &SchedulingFile,
        memory: Arc<GpuMemoryManager>,
    ) -> Result<Arc<ModelManager>> {
        let config = self.model_manager_config(scheduling)?;

        let registry_file = &self.daemon_args.registry_file;
        let registry = ModelRegistry::load(registry_file)
            .with_context(|| format!("failed to load model registry {}", registry_file.display()))?
            .with_persist_path(registry_file);
        tracing::info!(models = registry.len(), "Model registry ready");

        let mut models = ModelManager::new(config, registry, memory, self.clock.clone())?;
        if models.config().enable_download {
            models = models.with_fetcher(Arc::new(HttpArtifactFetcher::new()?));
        }
        Ok(Arc::new(models))
    }

    /// File settings with command-line overrides applied on top.
    fn model_manager_config(&self, scheduling: &SchedulingFile) -> Result<ModelManagerConfig> {
        let args = &self.daemon_args;
        let mut config = scheduling.model_manager_config(args.models_dir.clone())?;
        if let Some(max_cache_size) = args.max_cache_size {
            config.max_cache_size = max_cache_size;
        }
        if let Some(enable_download) = args.enable_download {
            config.enable_download = enable_download;
        }
        if let Some(enable_cpu_fallback) = args.enable_cpu_fallback {
            config.enable_cpu_fallback = enable_cpu_fallback;
        }
        config.validate()?;
        Ok(config)
    }
}
