use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ModerationConfig, ModerationPolicy};
use crate::error::AppError;
use crate::utils::retry::{retry_with_backoff, RetryConfig};
use crate::videogen::upstream::decode_response;

#[derive(Serialize)]
struct ModerationRequest<'a> {
    input: &'a str,
}

#[derive(Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationVerdict>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModerationVerdict {
    pub flagged: bool,
    #[serde(default)]
    pub categories: BTreeMap<String, bool>,
    #[serde(default)]
    pub category_scores: BTreeMap<String, f64>,
}

impl ModerationVerdict {
    /// Flagged category names; the highest-scoring one when none is marked
    pub fn flagged_categories(&self) -> Vec<String> {
        let marked: Vec<String> = self
            .categories
            .iter()
            .filter(|(_, flagged)| **flagged)
            .map(|(name, _)| name.clone())
            .collect();
        if !marked.is_empty() {
            return marked;
        }
        self.category_scores
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(name, _)| vec![name.clone()])
            .unwrap_or_default()
    }
}

/// Text classifier: given text, returns flagged plus category scores
#[async_trait]
pub trait ModerationClient: Send + Sync {
    async fn classify(&self, text: &str) -> Result<ModerationVerdict, AppError>;
}

/// OpenAI-compatible `/v1/moderations` endpoint
pub struct OpenAiModerationClient {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
    retry: RetryConfig,
}

impl OpenAiModerationClient {
    pub fn new(config: &ModerationConfig, api_key: String) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            api_url: config.api_url.clone(),
            retry: config.retry.clone(),
        })
    }
}

#[async_trait]
impl ModerationClient for OpenAiModerationClient {
    async fn classify(&self, text: &str) -> Result<ModerationVerdict, AppError> {
        let raw = retry_with_backoff(&self.retry, "moderation", AppError::is_retryable, move || async move {
            let response = self
                .client
                .post(&self.api_url)
                .bearer_auth(&self.api_key)
                .json(&ModerationRequest { input: text })
                .send()
                .await
                .map_err(|e| AppError::UpstreamTransport(e.to_string()))?;
            decode_response(response).await
        })
        .await?;

        let parsed: ModerationResponse = serde_json::from_value(raw)
            .map_err(|e| AppError::UpstreamTransport(format!("unexpected moderation response: {e}")))?;
        parsed
            .results
            .into_iter()
            .next()
            .ok_or_else(|| AppError::UpstreamTransport("moderation response had no results".into()))
    }
}

/// Applies the configured policy around a [`ModerationClient`]
pub struct PromptModerator {
    client: Option<Arc<dyn ModerationClient>>,
    policy: ModerationPolicy,
}

impl PromptModerator {
    pub fn new(client: Option<Arc<dyn ModerationClient>>, policy: ModerationPolicy) -> Self {
        Self { client, policy }
    }

    pub fn from_config(config: &ModerationConfig) -> Result<Self, AppError> {
        if !config.enabled {
            log::info!("prompt moderation disabled");
            return Ok(Self::new(None, config.policy));
        }
        let client: Option<Arc<dyn ModerationClient>> = match &config.api_key {
            Some(key) => Some(Arc::new(OpenAiModerationClient::new(config, key.clone())?)),
            None => {
                log::warn!("moderation api_key not set, skipping prompt moderation");
                None
            }
        };
        Ok(Self::new(client, config.policy))
    }

    /// Rejects flagged prompts with 403; an unreachable classifier follows the policy
    pub async fn check_prompt(&self, prompt: &str) -> Result<(), AppError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Ok(());
        }
        let Some(client) = &self.client else {
            return Ok(());
        };

        let verdict = match client.classify(prompt).await {
            Ok(verdict) => verdict,
            Err(e) => {
                return match self.policy {
                    ModerationPolicy::FailOpen => {
                        log::warn!("moderation unavailable, allowing prompt through: {e}");
                        Ok(())
                    }
                    ModerationPolicy::FailClosed => {
                        log::error!("moderation unavailable, rejecting request: {e}");
                        Err(AppError::ModerationUnavailable(e.to_string()))
                    }
                };
            }
        };

        if verdict.flagged {
            let categories = verdict.flagged_categories();
            log::info!(
                "Prompt rejected by moderation: {} (categories: {categories:?})",
                prompt.chars().take(60).collect::<String>()
            );
            return Err(AppError::ContentRejected { categories });
        }
        Ok(())
    }
}
