use std::path::PathBuf;
use std::time::Duration;

use super::pressure::PressureThresholds;
use crate::error::ComputeError;
use crate::error::Result;

/// Tunables for [`super::ModelManager`].
#[derive(Debug, Clone)]
pub struct ModelManagerConfig {
    /// Models kept resident at once
    pub max_cache_size: usize,
    /// Root for relative artifact paths and staged downloads
    pub models_dir: PathBuf,
    pub enable_download: bool,
    pub download_attempts: u32,
    pub download_retry_delay: Duration,
    pub enable_cpu_fallback: bool,
    pub pressure: PressureThresholds,
}

impl Default for ModelManagerConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 3,
            models_dir: PathBuf::from("models"),
            enable_download: true,
            download_attempts: 3,
            download_retry_delay: Duration::from_secs(1),
            enable_cpu_fallback: true,
            pressure: PressureThresholds::default(),
        }
    }
}

impl ModelManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_size == 0 {
            return Err(ComputeError::config("max_cache_size must be at least 1"));
        }
        if self.enable_download && self.download_attempts == 0 {
            return Err(ComputeError::config(
                "download_attempts must be at least 1 when downloads are enabled",
            ));
        }
        self.pressure.validate().map_err(ComputeError::config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        ModelManagerConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_cache_is_rejected() {
        let config = ModelManagerConfig {
            max_cache_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ComputeError::Configuration { .. })
        ));
    }
}
