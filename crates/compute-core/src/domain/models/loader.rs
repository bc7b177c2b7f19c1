//! Seams between the model manager and whatever turns an artifact into a
//! usable model.

use std::fmt::Debug;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use api_types::ComputeDevice;
use api_types::ModelInfo;
use async_trait::async_trait;

use crate::error::ComputeError;
use crate::error::Result;

/// A model artifact that has been brought into memory for a device.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedArtifact {
    pub model_id: String,
    pub path: Option<PathBuf>,
    pub size_bytes: u64,
    pub device: ComputeDevice,
}

pub type ModelHandle = Arc<LoadedArtifact>;

/// Turns an artifact on disk into a handle bound to `device`.
#[async_trait]
pub trait ModelLoader: Send + Sync + Debug {
    async fn load(&self, info: &ModelInfo, path: &Path, device: ComputeDevice) -> Result<ModelHandle>;
}

/// Downloads an artifact to `destination`, returning the number of bytes written.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync + Debug {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<u64>;
}

/// Loader that only checks the artifact is a readable regular file.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileModelLoader;

#[async_trait]
impl ModelLoader for FileModelLoader {
    async fn load(&self, info: &ModelInfo, path: &Path, device: ComputeDevice) -> Result<ModelHandle> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| ComputeError::io(path, e))?;
        if !metadata.is_file() {
            return Err(ComputeError::ArtifactUnavailable {
                model_id: info.model_id.clone(),
                message: format!("{} is not a regular file", path.display()),
            });
        }
        // Touch the first bytes so permission problems surface here.
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ComputeError::io(path, e))?;
        drop(file);

        tracing::debug!(
            model_id = %info.model_id,
            path = %path.display(),
            size_bytes = metadata.len(),
            %device,
            "Loaded model artifact"
        );
        Ok(Arc::new(LoadedArtifact {
            model_id: info.model_id.clone(),
            path: Some(path.to_path_buf()),
            size_bytes: metadata.len(),
            device,
        }))
    }
}

/// Where the artifact for `info` lives, or should be staged, under `models_dir`.
pub fn artifact_path(info: &ModelInfo, models_dir: &Path) -> PathBuf {
    match &info.file_path {
        Some(path) if path.is_absolute() => path.clone(),
        Some(path) => models_dir.join(path),
        None => models_dir.join(format!("{}.bin", info.model_id)),
    }
}
