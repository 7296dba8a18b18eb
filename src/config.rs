use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::consts::{
    DEFAULT_PORT, FAL_QUEUE_URL, FAL_SYNC_URL, OPENAI_MODERATION_URL, REPLICATE_API_URL,
};
use crate::error::AppError;
use crate::utils::retry::RetryConfig;
use crate::videogen::profiles::{ProfileRegistry, ProviderKind};
use crate::videogen::types::GenerationKind;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Optional override file looked up in the working directory
const LOCAL_CONFIG_FILE: &str = "video-gen-proxy";

#[derive(Debug, Clone, Deserialize)]
pub struct FalConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_fal_queue_url")]
    pub queue_url: String,
    #[serde(default = "default_fal_sync_url")]
    pub sync_url: String,
    #[serde(default = "default_true")]
    pub use_queue: bool,
    /// Public base URL of this service; enables `fal_webhook` registration
    pub webhook_url: Option<String>,
}

impl Default for FalConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            queue_url: default_fal_queue_url(),
            sync_url: default_fal_sync_url(),
            use_queue: true,
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicateConfig {
    pub api_token: Option<String>,
    #[serde(default = "default_replicate_api_url")]
    pub api_url: String,
    pub webhook_url: Option<String>,
    /// `whsec_...` key that Replicate signs callbacks with; unsigned callbacks are refused
    pub webhook_secret: Option<String>,
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            api_url: default_replicate_api_url(),
            webhook_url: None,
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_upstream_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

/// What to do when the moderation service cannot give an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationPolicy {
    /// Let the prompt through
    #[default]
    FailOpen,
    /// Reject with 503 so the client retries later
    FailClosed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModerationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub api_key: Option<String>,
    #[serde(default = "default_moderation_url")]
    pub api_url: String,
    #[serde(default)]
    pub policy: ModerationPolicy,
    #[serde(default = "default_moderation_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            api_url: default_moderation_url(),
            policy: ModerationPolicy::default(),
            timeout_secs: default_moderation_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlobStoreConfig {
    pub bucket: String,
    #[serde(default = "default_public_url_base")]
    pub public_url_base: String,
    #[serde(default = "default_blob_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub default_text_model: String,
    pub default_image_model: String,
    #[serde(default)]
    pub fal: FalConfig,
    #[serde(default)]
    pub replicate: ReplicateConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    pub blob_store: Option<BlobStoreConfig>,
    #[serde(default)]
    pub models: Vec<crate::videogen::profiles::ModelProfile>,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_fal_queue_url() -> String {
    FAL_QUEUE_URL.to_string()
}

fn default_fal_sync_url() -> String {
    FAL_SYNC_URL.to_string()
}

fn default_replicate_api_url() -> String {
    REPLICATE_API_URL.to_string()
}

fn default_moderation_url() -> String {
    OPENAI_MODERATION_URL.to_string()
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_moderation_timeout() -> u64 {
    10
}

fn default_public_url_base() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_blob_prefix() -> String {
    "videos".to_string()
}

/// Credentials commonly exported under their vendor names
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("FAL_API_KEY", "fal.api_key"),
    ("FAL_KEY", "fal.api_key"),
    ("REPLICATE_API_TOKEN", "replicate.api_token"),
    ("REPLICATE_WEBHOOK_SIGNING_SECRET", "replicate.webhook_secret"),
    ("OPENAI_API_KEY", "moderation.api_key"),
    ("SENTRY_DSN", "sentry_dsn"),
    ("WEBHOOK_URL", "fal.webhook_url"),
];

impl AppConfig {
    /// Embedded defaults, then `video-gen-proxy.toml`, then `SECTION__KEY` env vars
    pub fn load() -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        for (env_key, config_key) in LEGACY_ENV_KEYS {
            if let Ok(value) = std::env::var(env_key) {
                builder = builder.set_default(*config_key, value)?;
            }
        }

        let config = builder
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::with_name(LOCAL_CONFIG_FILE).required(false))
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parses a TOML document layered over the embedded defaults
    #[cfg(test)]
    pub fn from_toml(overrides: &str) -> anyhow::Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::from_str(overrides, FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Checks cross-field invariants and builds the profile table
    pub fn validate(&self) -> Result<ProfileRegistry, AppError> {
        let registry = ProfileRegistry::new(self.models.clone())?;

        let defaults = [
            (&self.default_text_model, GenerationKind::TextToVideo),
            (&self.default_image_model, GenerationKind::ImageToVideo),
        ];
        for (key, kind) in defaults {
            let profile = registry.get(key).map_err(|_| {
                AppError::Configuration(format!("default model '{key}' is not configured"))
            })?;
            if profile.kind != kind {
                return Err(AppError::Configuration(format!(
                    "default model '{key}' does not support {kind:?}"
                )));
            }
        }

        if self.moderation.enabled
            && self.moderation.policy == ModerationPolicy::FailClosed
            && self.moderation.api_key.is_none()
        {
            return Err(AppError::Configuration(
                "moderation is fail_closed but no moderation api_key is set".to_string(),
            ));
        }

        if self.replicate.webhook_url.is_some() && self.replicate.webhook_secret.is_none() {
            tracing::warn!(
                "replicate.webhook_url is set without replicate.webhook_secret; callbacks will be refused"
            );
        }

        for profile in registry.iter() {
            if !self.has_credentials(profile.provider) {
                tracing::warn!(
                    "model '{}' uses {:?} but no credentials are configured; requests to it will fail",
                    profile.key,
                    profile.provider
                );
            }
        }

        Ok(registry)
    }

    pub fn has_credentials(&self, provider: ProviderKind) -> bool {
        match provider {
            ProviderKind::Fal => self.fal.api_key.is_some(),
            ProviderKind::Replicate => self.replicate.api_token.is_some(),
        }
    }
}
