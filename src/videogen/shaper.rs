use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::error::AppError;
use crate::videogen::profiles::{ImageTransport, ModelProfile, SubmissionShape};
use crate::videogen::types::{GenerationKind, GenerationRequest, ImagePayload};

/// Body ready to be sent to a provider
#[derive(Debug, Clone)]
pub enum ShapedBody {
    Json(Value),
    /// Flat form fields plus one binary file part
    Multipart {
        fields: Map<String, Value>,
        file_field: String,
        image: ImagePayload,
    },
}

#[derive(Debug, Clone)]
pub struct ShapedPayload {
    pub body: ShapedBody,
    /// Caller parameters replaced by the profile's forced values
    pub overridden: Vec<String>,
    image_field: Option<String>,
}

impl ShapedPayload {
    /// Copy of the payload safe to log: image content replaced by its size
    pub fn redacted(&self) -> Value {
        match &self.body {
            ShapedBody::Json(body) => {
                let mut body = body.clone();
                if let Some(field) = &self.image_field {
                    let nested = matches!(body.get("input"), Some(Value::Object(_)));
                    let target = if nested {
                        body.get_mut("input").and_then(Value::as_object_mut)
                    } else {
                        body.as_object_mut()
                    };
                    if let Some(slot) = target.and_then(|fields| fields.get_mut(field)) {
                        let len = slot.as_str().map(str::len).unwrap_or_default();
                        *slot = json!(format!("<redacted {len} bytes>"));
                    }
                }
                body
            }
            ShapedBody::Multipart {
                fields,
                file_field,
                image,
            } => {
                let mut fields = fields.clone();
                fields.insert(
                    file_field.clone(),
                    json!(format!("<binary {} bytes>", image.bytes.len())),
                );
                Value::Object(fields)
            }
        }
    }
}

pub fn to_data_uri(image: &ImagePayload) -> String {
    format!(
        "data:{};base64,{}",
        image.mime_type,
        BASE64.encode(&image.bytes)
    )
}

/// Builds the provider submission body for `request` under `profile`.
///
/// `image_field` names the parameter carrying the image; it is ignored for
/// text requests. Field precedence, lowest first: profile defaults, caller
/// parameters, prompt and image, forced fields.
pub fn shape_request(
    request: &GenerationRequest,
    profile: &ModelProfile,
    image_field: &str,
) -> Result<ShapedPayload, AppError> {
    let prompt = request.prompt.trim();
    let empty_prompt_allowed =
        profile.allow_empty_prompt && request.kind == GenerationKind::ImageToVideo;
    if prompt.is_empty() && !empty_prompt_allowed {
        return Err(AppError::invalid("prompt required"));
    }

    let image = match (request.kind, &request.image) {
        (GenerationKind::ImageToVideo, Some(image)) => {
            if !profile.supports_image() {
                return Err(AppError::invalid(format!(
                    "model '{}' does not accept an image",
                    profile.key
                )));
            }
            if image.bytes.is_empty() {
                return Err(AppError::invalid("image file is empty"));
            }
            let ceiling = profile.max_image_bytes(&image.mime_type);
            if image.bytes.len() as u64 > ceiling {
                return Err(AppError::PayloadTooLarge(format!(
                    "Image too large ({} bytes). Please use a smaller image (<{ceiling} bytes).",
                    image.bytes.len()
                )));
            }
            Some(image)
        }
        (GenerationKind::ImageToVideo, None) => {
            return Err(AppError::invalid("image file required (multipart field: image)"));
        }
        (GenerationKind::TextToVideo, Some(_)) => {
            return Err(AppError::invalid("text-to-video requests must not carry an image"));
        }
        (GenerationKind::TextToVideo, None) => {
            if profile.supports_image() {
                return Err(AppError::invalid(format!(
                    "model '{}' requires an image",
                    profile.key
                )));
            }
            None
        }
    };

    let mut fields = profile.default_parameters.clone();
    for (name, value) in &request.parameters {
        if name == "prompt" || profile.image_fields.contains(name) {
            continue;
        }
        fields.insert(name.clone(), value.clone());
    }
    if !prompt.is_empty() {
        fields.insert("prompt".to_string(), json!(prompt));
    }

    let mut overridden = Vec::new();
    for (name, forced) in &profile.forced_fields {
        if let Some(previous) = fields.get(name) {
            if previous != forced {
                warn!(
                    model = %profile.key,
                    field = %name,
                    "overriding caller value {previous} with required {forced}"
                );
                overridden.push(name.clone());
            }
        }
        fields.insert(name.clone(), forced.clone());
    }

    let (body, image_field) = match (image, profile.image_transport) {
        (Some(image), ImageTransport::Multipart) => (
            ShapedBody::Multipart {
                fields,
                file_field: image_field.to_string(),
                image: image.clone(),
            },
            Some(image_field.to_string()),
        ),
        (Some(image), ImageTransport::DataUri) => {
            fields.insert(image_field.to_string(), json!(to_data_uri(image)));
            (
                ShapedBody::Json(wrap(fields, profile.submission_shape)),
                Some(image_field.to_string()),
            )
        }
        (None, _) => (ShapedBody::Json(wrap(fields, profile.submission_shape)), None),
    };

    let payload = ShapedPayload {
        body,
        overridden,
        image_field,
    };

    info!(
        model = %profile.key,
        payload = %payload.redacted(),
        "shaped submission payload"
    );

    Ok(payload)
}

fn wrap(fields: Map<String, Value>, shape: SubmissionShape) -> Value {
    match shape {
        SubmissionShape::Flat => Value::Object(fields),
        SubmissionShape::NestedUnderInput => json!({ "input": fields }),
    }
}
