use std::sync::Arc;

use crate::memory::GpuMemoryManager;
use crate::models::ModelManager;
use crate::scheduler::GpuJobScheduler;

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub scheduler: GpuJobScheduler,
    pub memory: Arc<GpuMemoryManager>,
    pub models: Arc<ModelManager>,
}
