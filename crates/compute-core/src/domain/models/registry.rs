//! Durable catalog of model metadata.
//!
//! The on-disk form is a single JSON object keyed by `model_id`. Saves go
//! through a temporary file in the target directory followed by a rename, so
//! readers never observe a half-written catalog.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use api_types::ModelInfo;
use api_types::ModelType;

use crate::error::ComputeError;
use crate::error::Result;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelInfo>,
    persist_path: Option<PathBuf>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that rewrites `path` after every change.
    pub fn with_persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    pub fn register(&mut self, info: ModelInfo) -> Result<()> {
        if info.model_id.is_empty() {
            return Err(ComputeError::config("model_id must not be empty"));
        }
        if self.models.contains_key(&info.model_id) {
            return Err(ComputeError::AlreadyExists {
                kind: "model",
                id: info.model_id,
            });
        }
        tracing::info!(
            model_id = %info.model_id,
            model_type = ?info.model_type,
            gpu_memory_required = info.gpu_memory_required,
            "Registered model"
        );
        self.models.insert(info.model_id.clone(), info);
        self.auto_persist()
    }

    pub fn unregister(&mut self, model_id: &str) -> Result<Option<ModelInfo>> {
        let removed = self.models.remove(model_id);
        if removed.is_some() {
            tracing::info!(model_id, "Unregistered model");
            self.auto_persist()?;
        }
        Ok(removed)
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelInfo> {
        self.models.get(model_id)
    }

    pub fn list(&self) -> Vec<&ModelInfo> {
        self.models.values().collect()
    }

    pub fn by_type(&self, model_type: ModelType) -> Vec<&ModelInfo> {
        self.models
            .values()
            .filter(|info| info.model_type == model_type)
            .collect()
    }

    pub fn by_operation(&self, operation: &str) -> Vec<&ModelInfo> {
        self.models
            .values()
            .filter(|info| info.supported_operations.iter().any(|op| op == operation))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.models)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let models: BTreeMap<String, ModelInfo> = serde_json::from_str(json)?;
        if let Some((key, info)) = models.iter().find(|(key, info)| **key != info.model_id) {
            return Err(ComputeError::config(format!(
                "registry key `{key}` does not match model_id `{}`",
                info.model_id
            )));
        }
        Ok(Self {
            models,
            persist_path: None,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| ComputeError::io(dir, e))?;

        let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(|e| ComputeError::io(dir, e))?;
        staged
            .write_all(json.as_bytes())
            .and_then(|()| staged.as_file().sync_all())
            .map_err(|e| ComputeError::io(staged.path(), e))?;
        staged
            .persist(path)
            .map_err(|e| ComputeError::io(path, e.error))?;

        tracing::debug!(path = %path.display(), models = self.len(), "Saved model registry");
        Ok(())
    }

    /// Load a registry; a missing file yields an empty one.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(json) => {
                let registry = Self::from_json(&json)?;
                tracing::info!(path = %path.display(), models = registry.len(), "Loaded model registry");
                Ok(registry)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(ComputeError::io(path, e)),
        }
    }

    fn auto_persist(&self) -> Result<()> {
        match &self.persist_path {
            Some(path) => self.save(path),
            None => Ok(()),
        }
    }
}
