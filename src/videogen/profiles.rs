use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::consts::DEFAULT_UPLOAD_LIMIT_BYTES;
use crate::error::AppError;
use crate::videogen::types::GenerationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Fal,
    Replicate,
}

/// Where request fields land in the submission body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionShape {
    Flat,
    NestedUnderInput,
}

/// How image bytes travel to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageTransport {
    /// `data:<mime>;base64,<payload>` inside the JSON body
    #[default]
    DataUri,
    /// Raw bytes as a multipart file part
    Multipart,
}

/// Static per-model calling convention, loaded once from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub key: String,
    pub provider: ProviderKind,
    pub kind: GenerationKind,
    /// Upstream model slug, e.g. `fal-ai/veo2/image-to-video`
    pub model_id: String,
    /// Tried when the primary slug cannot be resolved (Replicate version listing)
    #[serde(default)]
    pub fallback_model_id: Option<String>,
    /// Pinned Replicate version id
    #[serde(default)]
    pub version: Option<String>,
    pub submission_shape: SubmissionShape,
    #[serde(default)]
    pub image_transport: ImageTransport,
    /// Image parameter names, tried in order when the provider rejects one
    #[serde(default = "default_image_fields")]
    pub image_fields: Vec<String>,
    /// Provider limit on the encoded request payload
    #[serde(default = "default_upload_limit")]
    pub upload_limit_bytes: u64,
    #[serde(default)]
    pub allow_empty_prompt: bool,
    /// Applied last, overriding caller values
    #[serde(default)]
    pub forced_fields: Map<String, Value>,
    /// Applied first, caller values override them
    #[serde(default)]
    pub default_parameters: Map<String, Value>,
}

fn default_image_fields() -> Vec<String> {
    vec!["image_url".to_string()]
}

fn default_upload_limit() -> u64 {
    DEFAULT_UPLOAD_LIMIT_BYTES
}

impl ModelProfile {
    pub fn supports_image(&self) -> bool {
        self.kind == GenerationKind::ImageToVideo
    }

    /// Largest raw image accepted for this profile.
    ///
    /// Data URIs grow by 4/3 plus the `data:<mime>;base64,` prefix, so the raw
    /// ceiling is derived from the provider's encoded limit rather than fixed.
    pub fn max_image_bytes(&self, mime_type: &str) -> u64 {
        match self.image_transport {
            ImageTransport::Multipart => self.upload_limit_bytes,
            ImageTransport::DataUri => {
                let prefix = format!("data:{mime_type};base64,").len() as u64;
                // Room for the prompt and the rest of the JSON body
                let envelope = prefix + 4 * 1024;
                self.upload_limit_bytes.saturating_sub(envelope) / 4 * 3
            }
        }
    }

    /// `fal-ai/veo2/image-to-video` -> `fal-ai/veo2`
    pub fn base_model_id(&self) -> &str {
        let mut slashes = self.model_id.match_indices('/');
        match (slashes.next(), slashes.next()) {
            (Some(_), Some((second, _))) => &self.model_id[..second],
            _ => &self.model_id,
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.image_transport == ImageTransport::Multipart
            && self.submission_shape != SubmissionShape::Flat
        {
            return Err(AppError::Configuration(format!(
                "model '{}' sends images as multipart, which requires the flat submission shape",
                self.key
            )));
        }
        if self.image_transport == ImageTransport::Multipart
            && self.provider == ProviderKind::Replicate
        {
            return Err(AppError::Configuration(format!(
                "model '{}': replicate predictions only accept JSON bodies",
                self.key
            )));
        }
        if self.supports_image() && self.image_fields.is_empty() {
            return Err(AppError::Configuration(format!(
                "model '{}' accepts images but lists no image_fields",
                self.key
            )));
        }
        Ok(())
    }
}

/// Immutable lookup table of model profiles
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<String, ModelProfile>,
    order: Vec<String>,
}

impl ProfileRegistry {
    pub fn new(profiles: Vec<ModelProfile>) -> Result<Self, AppError> {
        let mut map = HashMap::with_capacity(profiles.len());
        let mut order = Vec::with_capacity(profiles.len());
        for profile in profiles {
            profile.validate()?;
            if map.contains_key(&profile.key) {
                return Err(AppError::Configuration(format!(
                    "duplicate model key '{}'",
                    profile.key
                )));
            }
            order.push(profile.key.clone());
            map.insert(profile.key.clone(), profile);
        }
        Ok(Self {
            profiles: map,
            order,
        })
    }

    pub fn get(&self, key: &str) -> Result<&ModelProfile, AppError> {
        self.profiles
            .get(key)
            .ok_or_else(|| AppError::UnknownModel(key.to_string()))
    }

    pub fn keys(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelProfile> {
        self.order.iter().filter_map(|key| self.profiles.get(key))
    }
}
