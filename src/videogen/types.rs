use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::Display;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    TextToVideo,
    ImageToVideo,
}

/// Raw image bytes as uploaded by the client
#[derive(Clone)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub filename: Option<String>,
}

impl std::fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePayload")
            .field("len", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .field("filename", &self.filename)
            .finish()
    }
}

/// A client generation request before it is shaped for a provider.
///
/// `image` is present exactly when `kind` is [`GenerationKind::ImageToVideo`].
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    pub prompt: String,
    pub image: Option<ImagePayload>,
    pub model_key: String,
    pub parameters: Map<String, Value>,
}

impl GenerationRequest {
    pub fn text(model_key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            kind: GenerationKind::TextToVideo,
            prompt: prompt.into(),
            image: None,
            model_key: model_key.into(),
            parameters: Map::new(),
        }
    }

    pub fn image(
        model_key: impl Into<String>,
        prompt: impl Into<String>,
        image: ImagePayload,
    ) -> Self {
        Self {
            kind: GenerationKind::ImageToVideo,
            prompt: prompt.into(),
            image: Some(image),
            model_key: model_key.into(),
            parameters: Map::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Provider-independent job status.
///
/// Serialized in upper snake case (`IN_QUEUE`, `COMPLETED`, ...) on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NormalizedStatus {
    InQueue,
    InProgress,
    Completed,
    Failed,
}

impl NormalizedStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NormalizedStatus::Completed | NormalizedStatus::Failed)
    }
}

/// JSON body of `POST /video/generate_text`
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct TextGenerationBody {
    pub prompt: Option<String>,
    /// Model profile key; the configured text default when absent
    pub model: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub duration: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub resolution: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub aspect_ratio: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub fps: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub watermark: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub generate_audio: Option<Value>,
    /// Any further provider parameters, passed through as-is
    #[schema(value_type = Option<Object>)]
    pub parameters: Option<Map<String, Value>>,
}

impl TextGenerationBody {
    /// Collects the tuning knobs into one parameter map
    pub fn parameters(&self) -> Map<String, Value> {
        let mut params = self.parameters.clone().unwrap_or_default();
        let knobs = [
            ("duration", &self.duration),
            ("resolution", &self.resolution),
            ("aspect_ratio", &self.aspect_ratio),
            ("fps", &self.fps),
            ("watermark", &self.watermark),
            ("generate_audio", &self.generate_audio),
        ];
        for (name, value) in knobs {
            if let Some(value) = value {
                params.insert(name.to_string(), value.clone());
            }
        }
        params
    }
}

/// Multipart form of `POST /video/generate_image` (documentation only)
#[allow(dead_code)]
#[derive(ToSchema)]
pub struct ImageGenerationForm {
    #[schema(value_type = String, format = Binary)]
    pub image: Vec<u8>,
    pub prompt: Option<String>,
    pub model: Option<String>,
}

/// Returned by both generate endpoints
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QueuedResponse {
    pub status: NormalizedStatus,
    pub request_id: String,
    pub status_url: String,
    pub response_url: String,
    /// Provider-assigned job id
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    /// Caller parameters replaced by the model's fixed values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overridden: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub raw: Option<Value>,
}

/// Returned by the result endpoints
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResultResponse {
    pub status: NormalizedStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultQuery {
    pub status_url: Option<String>,
    /// Model key used to rebuild the upstream status URL for ids this process never saw
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    pub ok: bool,
    pub use_queue: bool,
    pub default_text_model: String,
    pub default_image_model: String,
    pub models: Vec<String>,
    #[schema(value_type = Object)]
    pub resolved_versions: Map<String, Value>,
}
