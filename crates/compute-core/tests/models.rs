use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use api_types::AlertKind;
use api_types::ComputeDevice;
use api_types::JobStatus;
use api_types::ModelInfo;
use api_types::ModelType;
use chrono::Utc;
use compute_core::artifacts::HttpArtifactFetcher;
use compute_core::clock::ManualClock;
use compute_core::clock::SharedClock;
use compute_core::devices::DeviceSpec;
use compute_core::devices::GpuDevice;
use compute_core::error::ComputeError;
use compute_core::memory::GpuMemoryManager;
use compute_core::memory::MemoryConfig;
use compute_core::models::DeviceRequest;
use compute_core::models::MemoryPressure;
use compute_core::models::ModelManager;
use compute_core::models::ModelManagerConfig;
use compute_core::models::ModelRegistry;
use compute_core::scheduler::job_fn;
use compute_core::scheduler::GpuJobRequest;
use compute_core::scheduler::GpuJobScheduler;
use compute_core::scheduler::JobType;
use compute_core::scheduler::SchedulerConfig;
use similar_asserts::assert_eq;
use test_log::test;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

fn model(model_id: &str, model_type: ModelType, memory_mb: u64) -> ModelInfo {
    ModelInfo {
        model_id: model_id.to_string(),
        model_type,
        version: "1.0.0".to_string(),
        size_mb: 32.0,
        gpu_memory_required: memory_mb,
        supported_operations: vec!["enhance".to_string()],
        performance_characteristics: BTreeMap::from([("fps".to_string(), 30.0)]),
        file_path: None,
        download_url: None,
        checksum: None,
    }
}

fn quiet_memory_config() -> MemoryConfig {
    MemoryConfig {
        telemetry_jitter: 0.0,
        telemetry_seed: Some(42),
        fragmentation_ratio: 0.0,
        ..MemoryConfig::default()
    }
}

fn memory_manager(total_mb: u64, clock: SharedClock) -> Arc<GpuMemoryManager> {
    let devices = [DeviceSpec {
        id: 0,
        name: "sim-0".to_string(),
        memory_mb: total_mb,
    }];
    Arc::new(GpuMemoryManager::new(&devices, quiet_memory_config(), clock).unwrap())
}

/// Registry plus on-disk artifacts for every model in `models`.
fn staged_registry(dir: &Path, models: &[ModelInfo]) -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    for info in models {
        std::fs::write(dir.join(format!("{}.bin", info.model_id)), b"weights").unwrap();
        registry.register(info.clone()).unwrap();
    }
    registry
}

fn manager(
    dir: &Path,
    registry: ModelRegistry,
    memory: Arc<GpuMemoryManager>,
    clock: SharedClock,
    max_cache_size: usize,
) -> ModelManager {
    let config = ModelManagerConfig {
        max_cache_size,
        models_dir: dir.to_path_buf(),
        ..ModelManagerConfig::default()
    };
    ModelManager::new(config, registry, memory, clock).unwrap()
}

#[test(tokio::test)]
async fn loading_past_capacity_evicts_least_recently_used() {
    let dir = tempfile::tempdir().unwrap();
    let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
    let memory = memory_manager(8192, clock.clone());
    let registry = staged_registry(
        dir.path(),
        &[
            model("a", ModelType::StyleTransfer, 1024),
            model("b", ModelType::SuperResolution, 1024),
            model("c", ModelType::FrameInterpolation, 1024),
        ],
    );
    let models = manager(dir.path(), registry, memory.clone(), clock, 2);

    models.load_model("a", DeviceRequest::Auto).await.unwrap();
    models.load_model("b", DeviceRequest::Auto).await.unwrap();
    assert!(models.load_model("a", DeviceRequest::Auto).await.unwrap().cache_hit);
    models.load_model("c", DeviceRequest::Auto).await.unwrap();

    let loaded: Vec<_> = models
        .list_loaded_models()
        .await
        .into_iter()
        .map(|m| m.model_id)
        .collect();
    assert_eq!(loaded, vec!["c".to_string(), "a".to_string()]);

    let stats = models.get_stats().await;
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.loaded_models, 2);
    assert_eq!(memory.current_status().allocated_mb, 2048);
}

#[test(tokio::test)]
async fn unknown_model_is_not_found_and_cache_is_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let clock: SharedClock = Arc::new(ManualClock::default());
    let memory = memory_manager(4096, clock.clone());
    let registry = staged_registry(dir.path(), &[model("known", ModelType::Generic, 512)]);
    let models = manager(dir.path(), registry, memory.clone(), clock, 3);
    models.load_model("known", DeviceRequest::Auto).await.unwrap();

    let err = models
        .load_model("unknown_id", DeviceRequest::Auto)
        .await
        .unwrap_err();
    assert!(matches!(err, ComputeError::ModelNotFound { .. }));

    let loaded = models.list_loaded_models().await;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].access_count, 1);
    assert_eq!(memory.allocation_count(), 1);
    assert!(!models.unload_model("unknown_id").await);
}

#[test]
fn registry_survives_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("registry.json");

    let mut registry = ModelRegistry::new();
    let mut esrgan = model("esrgan_x4", ModelType::SuperResolution, 2048);
    esrgan.supported_operations = vec!["upscale_4x".to_string(), "denoise".to_string()];
    esrgan.download_url = Some("https://models.example/esrgan_x4.pth".to_string());
    esrgan.checksum = Some("9f2c".to_string());
    registry.register(esrgan).unwrap();
    registry
        .register(model("nima", ModelType::QualityAssessment, 256))
        .unwrap();
    registry.save(&file).unwrap();

    let reloaded = ModelRegistry::load(&file).unwrap();
    assert_eq!(reloaded, registry);
    assert_eq!(reloaded.by_operation("denoise").len(), 1);
    assert_eq!(reloaded.by_type(ModelType::QualityAssessment).len(), 1);
}

#[test]
fn memory_alert_fires_once_and_expires_after_retention() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let memory = memory_manager(1000, clock.clone());
    memory.allocate("loader", 0, 900).unwrap();

    memory.get_status();
    memory.get_status();
    let memory_alerts = |alerts: Vec<api_types::Alert>| {
        alerts
            .into_iter()
            .filter(|a| a.kind == AlertKind::HighMemoryUsage)
            .count()
    };
    assert_eq!(memory_alerts(memory.active_alerts()), 1);

    clock.advance(memory.config().alert_retention + Duration::from_secs(1));
    assert_eq!(memory_alerts(memory.active_alerts()), 0);
}

#[test(tokio::test)]
async fn low_pressure_never_evicts() {
    let dir = tempfile::tempdir().unwrap();
    let clock: SharedClock = Arc::new(ManualClock::default());
    let memory = memory_manager(1000, clock.clone());
    let registry = staged_registry(
        dir.path(),
        &[
            model("a", ModelType::Generic, 450),
            model("b", ModelType::Generic, 450),
        ],
    );
    let models = manager(dir.path(), registry, memory.clone(), clock, 3);
    models.load_model("a", DeviceRequest::Auto).await.unwrap();
    models.load_model("b", DeviceRequest::Auto).await.unwrap();
    assert_eq!(models.check_memory_pressure(), MemoryPressure::High);

    for _ in 0..3 {
        let response = models.handle_memory_pressure(MemoryPressure::Low).await;
        assert!(response.evicted.is_empty());
        assert!(response.cleanup.is_none());
    }
    assert_eq!(models.list_loaded_models().await.len(), 2);
    assert_eq!(memory.current_status().allocated_mb, 900);
}

#[test(tokio::test)]
async fn missing_artifact_is_fetched_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/artifacts/rife.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 256]))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let clock: SharedClock = Arc::new(ManualClock::default());
    let memory = memory_manager(4096, clock.clone());
    let mut rife = model("rife", ModelType::FrameInterpolation, 1024);
    rife.download_url = Some(format!("{}/artifacts/rife.bin", server.uri()));
    let mut registry = ModelRegistry::new();
    registry.register(rife).unwrap();

    let models = manager(dir.path(), registry, memory, clock, 3)
        .with_fetcher(Arc::new(HttpArtifactFetcher::new().unwrap()));
    let loaded = models.load_model("rife", DeviceRequest::Auto).await.unwrap();

    assert_eq!(loaded.device, ComputeDevice::Gpu(0));
    assert_eq!(loaded.handle.size_bytes, 256);
    assert!(dir.path().join("rife.bin").exists());
    assert_eq!(models.get_stats().await.downloads, 1);

    // A second load is served from the cache without another request.
    assert!(models.load_model("rife", DeviceRequest::Auto).await.unwrap().cache_hit);
}

#[test(tokio::test)]
async fn loaded_model_handle_is_usable_from_a_job() {
    let dir = tempfile::tempdir().unwrap();
    let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
    let memory = memory_manager(8192, clock.clone());
    let registry = staged_registry(dir.path(), &[model("ada", ModelType::StyleTransfer, 1024)]);
    let models = manager(dir.path(), registry, memory, clock, 3);
    let loaded = models.load_model("ada", DeviceRequest::Auto).await.unwrap();

    let scheduler = GpuJobScheduler::with_system_clock(
        vec![GpuDevice::new(0, "sim-0", 8192)],
        SchedulerConfig::default(),
    )
    .unwrap();
    let handle = loaded.handle.clone();
    let job_id = scheduler
        .submit_job(
            GpuJobRequest::new(
                JobType::StyleTransfer,
                job_fn(move |_| {
                    let handle = handle.clone();
                    async move { Ok(serde_json::json!({ "model": handle.model_id })) }
                }),
            )
            .with_memory(512),
        )
        .unwrap();

    assert_eq!(scheduler.dispatch_once().dispatched, 1);
    assert!(scheduler.wait_for_idle(Duration::from_secs(2)).await);
    let result = scheduler.get_job_result(&job_id).unwrap();
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.result, Some(serde_json::json!({ "model": "ada" })));
}
