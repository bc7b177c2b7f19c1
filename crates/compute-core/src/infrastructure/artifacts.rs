//! HTTP download of model artifacts into the models directory.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::ComputeError;
use crate::error::Result;
use crate::models::ArtifactFetcher;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Streams an artifact to a sibling `.part` file and renames it into place
/// once the body has been fully written.
#[derive(Debug, Clone)]
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
}

impl HttpArtifactFetcher {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ComputeError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<u64> {
        let download_error = |message: String| ComputeError::Download {
            url: url.to_string(),
            message,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| download_error(e.to_string()))?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ComputeError::io(parent, e))?;
        }
        let mut staging = destination.as_os_str().to_owned();
        staging.push(".part");
        let staging = std::path::PathBuf::from(staging);

        let mut file = tokio::fs::File::create(&staging)
            .await
            .map_err(|e| ComputeError::io(&staging, e))?;
        let mut written = 0u64;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&staging).await;
                    return Err(download_error(e.to_string()));
                }
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| ComputeError::io(&staging, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| ComputeError::io(&staging, e))?;
        drop(file);

        tokio::fs::rename(&staging, destination)
            .await
            .map_err(|e| ComputeError::io(destination, e))?;
        tracing::debug!(url, bytes = written, path = %destination.display(), "Downloaded artifact");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;

    #[tokio::test]
    async fn downloads_into_destination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/esrgan.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 64]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("nested").join("esrgan.bin");
        let fetcher = HttpArtifactFetcher::new().unwrap();
        let written = fetcher
            .fetch(&format!("{}/models/esrgan.bin", server.uri()), &destination)
            .await
            .unwrap();

        assert_eq!(written, 64);
        assert_eq!(std::fs::read(&destination).unwrap(), vec![7u8; 64]);
        assert!(!dir.path().join("nested").join("esrgan.bin.part").exists());
    }

    #[tokio::test]
    async fn http_error_leaves_nothing_behind() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("missing.bin");
        let err = HttpArtifactFetcher::new()
            .unwrap()
            .fetch(&format!("{}/missing.bin", server.uri()), &destination)
            .await
            .unwrap_err();

        assert!(matches!(err, ComputeError::Download { .. }));
        assert!(!destination.exists());
    }
}
