use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::utils::gcs::{BlobStore, GcsBlobStore};
use crate::videogen::job_store::{InMemoryJobStore, JobStore};
use crate::videogen::normalizer::{LinkFetcher, ResultNormalizer};
use crate::videogen::profiles::ProfileRegistry;
use crate::videogen::prompt_moderation::PromptModerator;
use crate::videogen::upstream::{HttpUpstream, JobUpstream};

pub struct AppState {
    pub default_text_model: String,
    pub default_image_model: String,
    pub profiles: ProfileRegistry,
    pub upstream: Arc<dyn JobUpstream>,
    pub normalizer: ResultNormalizer,
    pub jobs: Arc<dyn JobStore>,
    pub moderator: PromptModerator,
    pub blob_store: Option<Arc<dyn BlobStore>>,
    pub replicate_webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let profiles = config.validate().context("invalid configuration")?;

        let upstream = Arc::new(HttpUpstream::from_config(config)?);
        let moderator = PromptModerator::from_config(&config.moderation)?;

        let blob_store: Option<Arc<dyn BlobStore>> = match &config.blob_store {
            Some(blob_config) => {
                log::info!("persisting completed videos to gs://{}", blob_config.bucket);
                Some(Arc::new(GcsBlobStore::new(
                    Arc::new(cloud_storage::Client::default()),
                    blob_config.clone(),
                    config.upstream.retry.clone(),
                    Duration::from_secs(config.upstream.timeout_secs),
                )?))
            }
            None => None,
        };

        Ok(Self::with_parts(
            config,
            profiles,
            upstream.clone(),
            upstream,
            Arc::new(InMemoryJobStore::new()),
            moderator,
            blob_store,
        ))
    }

    /// Wires explicit collaborators; used by `new` and by tests with fakes
    pub fn with_parts(
        config: &AppConfig,
        profiles: ProfileRegistry,
        upstream: Arc<dyn JobUpstream>,
        link_fetcher: Arc<dyn LinkFetcher>,
        jobs: Arc<dyn JobStore>,
        moderator: PromptModerator,
        blob_store: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        Self {
            default_text_model: config.default_text_model.clone(),
            default_image_model: config.default_image_model.clone(),
            profiles,
            upstream,
            normalizer: ResultNormalizer::new(link_fetcher),
            jobs,
            moderator,
            blob_store,
            replicate_webhook_secret: config.replicate.webhook_secret.clone(),
        }
    }
}
