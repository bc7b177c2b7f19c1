//! GPU memory accounting, monitoring and alerting

pub mod alerts;
pub mod config;
mod manager;
pub mod prediction;

pub use config::MemoryConfig;
pub use manager::GpuMemoryManager;
pub use prediction::MemorySample;
