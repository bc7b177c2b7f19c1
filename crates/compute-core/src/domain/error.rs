//! Error taxonomy for the compute core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("Model not found: {model_id}")]
    ModelNotFound { model_id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("Invalid parameter `{key}` for {job_type} job: {reason}")]
    InvalidParameter {
        job_type: String,
        key: String,
        reason: String,
    },

    #[error("Scheduler is shut down")]
    ShutDown,

    #[error("Insufficient capacity on {device}: requested {requested_mb} MB, available {available_mb} MB")]
    Capacity {
        device: String,
        requested_mb: u64,
        available_mb: u64,
    },

    #[error("Operation timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Circuit breaker is open")]
    BreakerOpen,

    #[error("Download of {url} failed: {message}")]
    Download { url: String, message: String },

    #[error("Artifact for model {model_id} unavailable: {message}")]
    ArtifactUnavailable { model_id: String, message: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ComputeError>;

impl ComputeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Capacity shortfalls are expected to clear on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Capacity { .. } | Self::BreakerOpen | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn capacity_message_names_device_and_sizes() {
        let err = ComputeError::Capacity {
            device: "cuda:1".to_string(),
            requested_mb: 4096,
            available_mb: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient capacity on cuda:1: requested 4096 MB, available 1024 MB"
        );
        assert!(err.is_transient());
        assert!(!ComputeError::config("x").is_transient());
    }
}
