//! Model catalog, LRU cache and load/unload orchestration

pub mod cache;
pub mod config;
pub mod loader;
mod manager;
pub mod pressure;
pub mod registry;

pub use config::ModelManagerConfig;
pub use loader::ArtifactFetcher;
pub use loader::FileModelLoader;
pub use loader::LoadedArtifact;
pub use loader::ModelHandle;
pub use loader::ModelLoader;
pub use manager::CachedModel;
pub use manager::DeviceRequest;
pub use manager::LoadedModel;
pub use manager::ModelManager;
pub use manager::ModelManagerStats;
pub use manager::PressureResponse;
pub use pressure::MemoryPressure;
pub use pressure::PressureThresholds;
pub use registry::ModelRegistry;
