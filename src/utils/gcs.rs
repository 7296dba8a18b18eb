use async_trait::async_trait;
use cloud_storage::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::BlobStoreConfig;
use crate::error::AppError;
use crate::utils::retry::{retry_with_backoff, RetryConfig};

/// Copies provider media somewhere that outlives the provider's signed URL
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns the durable URL for `source_url`
    async fn persist(&self, source_url: &str, job_id: &str) -> Result<String, AppError>;
}

pub struct GcsBlobStore {
    client: Arc<Client>,
    http: reqwest::Client,
    config: BlobStoreConfig,
    retry: RetryConfig,
}

impl GcsBlobStore {
    pub fn new(
        client: Arc<Client>,
        config: BlobStoreConfig,
        retry: RetryConfig,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            http,
            config,
            retry,
        })
    }

    async fn download(&self, url: &str) -> Result<(Vec<u8>, String), AppError> {
        retry_with_backoff(&self.retry, "media_download", AppError::is_retryable, move || async move {
            let response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| AppError::UpstreamTransport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(AppError::UpstreamHttp {
                    status: status.as_u16(),
                    body: response.text().await.unwrap_or_default(),
                });
            }
            let content_type = response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("video/mp4")
                .to_string();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| AppError::UpstreamTransport(e.to_string()))?;
            Ok((bytes.to_vec(), content_type))
        })
        .await
    }
}

/// `{prefix}/{job_id}.{ext}`, keeping the source extension when it is a video one
pub fn object_name(prefix: &str, job_id: &str, source_url: &str) -> String {
    let extension = reqwest::Url::parse(source_url)
        .ok()
        .and_then(|url| {
            url.path()
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
        })
        .filter(|ext| crate::consts::VIDEO_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or_else(|| "mp4".to_string());
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{job_id}.{extension}")
    } else {
        format!("{prefix}/{job_id}.{extension}")
    }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn persist(&self, source_url: &str, job_id: &str) -> Result<String, AppError> {
        let (bytes, content_type) = self.download(source_url).await?;
        let name = object_name(&self.config.prefix, job_id, source_url);

        info!(
            "Uploading {} bytes to GCS: {}/{}",
            bytes.len(),
            self.config.bucket,
            name
        );
        self.client
            .object()
            .create(&self.config.bucket, bytes, &name, &content_type)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to upload video to GCS: {e}"))?;

        let public_url = format!(
            "{}/{}/{}",
            self.config.public_url_base.trim_end_matches('/'),
            self.config.bucket,
            name
        );
        info!("Video persisted: {public_url}");
        Ok(public_url)
    }
}
