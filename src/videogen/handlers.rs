use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::app_state::AppState;
use crate::error::AppError;
use crate::videogen::orchestrator;
use crate::videogen::types::{
    GenerationRequest, HealthResponse, ImageGenerationForm, ImagePayload, QueuedResponse,
    ResultQuery, ResultResponse, TextGenerationBody,
};

/// Start a text-to-video job
#[utoipa::path(
    post,
    path = "/generate_text",
    request_body = TextGenerationBody,
    responses(
        (status = 200, description = "Job queued", body = QueuedResponse),
        (status = 400, description = "Missing prompt or unknown model"),
        (status = 403, description = "Prompt rejected by moderation"),
        (status = 502, description = "Provider error"),
        (status = 503, description = "Moderation unavailable"),
    ),
    tag = "VideoGen"
)]
pub async fn generate_text(
    State(state): State<Arc<AppState>>,
    body: Result<Json<TextGenerationBody>, JsonRejection>,
) -> Result<Json<QueuedResponse>, AppError> {
    let Json(body) = body.map_err(|e| AppError::invalid(e.body_text()))?;

    let model = body
        .model
        .clone()
        .unwrap_or_else(|| state.default_text_model.clone());
    let request = GenerationRequest::text(model, body.prompt.clone().unwrap_or_default())
        .with_parameters(body.parameters());

    let response = orchestrator::submit_generation(&state, request).await?;
    Ok(Json(response))
}

/// Multipart text fields arrive as strings; numbers and booleans are restored
fn form_field_value(text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Number(_) | Value::Bool(_))) => value,
        _ => Value::String(text.to_string()),
    }
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::invalid(e.body_text())
    }
}

/// Start an image-to-video job from a multipart upload
#[utoipa::path(
    post,
    path = "/generate_image",
    request_body(content = ImageGenerationForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Job queued", body = QueuedResponse),
        (status = 400, description = "Missing image or prompt"),
        (status = 403, description = "Prompt rejected by moderation"),
        (status = 413, description = "Image too large"),
        (status = 502, description = "Provider error"),
    ),
    tag = "VideoGen"
)]
pub async fn generate_image(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<QueuedResponse>, AppError> {
    let mut image = None;
    let mut prompt = String::new();
    let mut model = None;
    let mut parameters = Map::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let mime_type = field
                    .content_type()
                    .filter(|mime| mime.starts_with("image/"))
                    .unwrap_or("image/jpeg")
                    .to_string();
                let filename = field.file_name().map(str::to_string);
                let bytes = field.bytes().await.map_err(multipart_error)?;
                image = Some(ImagePayload {
                    bytes: bytes.to_vec(),
                    mime_type,
                    filename,
                });
            }
            "prompt" => prompt = field.text().await.map_err(multipart_error)?,
            "model" => model = Some(field.text().await.map_err(multipart_error)?),
            "parameters" => {
                let text = field.text().await.map_err(multipart_error)?;
                let extra: Map<String, Value> = serde_json::from_str(&text)
                    .map_err(|e| AppError::invalid(format!("parameters must be a JSON object: {e}")))?;
                parameters.extend(extra);
            }
            "" => continue,
            _ => {
                let text = field.text().await.map_err(multipart_error)?;
                parameters.insert(name, form_field_value(&text));
            }
        }
    }

    let Some(image) = image else {
        return Err(AppError::invalid("image file required (multipart field: image)"));
    };
    let model = model.unwrap_or_else(|| state.default_image_model.clone());
    let request = GenerationRequest::image(model, prompt, image).with_parameters(parameters);

    let response = orchestrator::submit_generation(&state, request).await?;
    Ok(Json(response))
}

/// Poll a job by the request id returned at submission
#[utoipa::path(
    get,
    path = "/result/{id}",
    params(
        ("id" = String, Path, description = "Request id"),
        ("model" = Option<String>, Query, description = "Model key, to poll ids this instance did not submit"),
    ),
    responses(
        (status = 200, description = "Current job status", body = ResultResponse),
        (status = 404, description = "Unknown request id"),
        (status = 502, description = "Provider error"),
    ),
    tag = "VideoGen"
)]
pub async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> Result<Json<ResultResponse>, AppError> {
    let response = orchestrator::poll_result(&state, &id, query.model.as_deref()).await?;
    Ok(Json(response))
}

/// Poll a job by a status URL (a proxy result path or a provider status URL)
#[utoipa::path(
    get,
    path = "/result",
    params(
        ("status_url" = String, Query, description = "Status URL returned at submission"),
        ("model" = Option<String>, Query, description = "Model key"),
    ),
    responses(
        (status = 200, description = "Current job status", body = ResultResponse),
        (status = 400, description = "Missing or disallowed status_url"),
        (status = 404, description = "Unknown request id"),
    ),
    tag = "VideoGen"
)]
pub async fn get_result_by_status_url(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResultQuery>,
) -> Result<Json<ResultResponse>, AppError> {
    let Some(status_url) = query.status_url.as_deref().filter(|s| !s.trim().is_empty()) else {
        return Err(AppError::invalid("status_url required"));
    };
    let response =
        orchestrator::poll_status_url(&state, status_url.trim(), query.model.as_deref()).await?;
    Ok(Json(response))
}

/// Service health and active model configuration
#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "Health"
)]
pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let profiles: Vec<_> = state.profiles.iter().collect();
    Json(HealthResponse {
        ok: true,
        use_queue: state.upstream.uses_queue(),
        default_text_model: state.default_text_model.clone(),
        default_image_model: state.default_image_model.clone(),
        models: state.profiles.keys().to_vec(),
        resolved_versions: state.upstream.resolved_versions(&profiles).await,
    })
}

/// Same as `/healthz`
#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "Health"
)]
pub async fn root(state: State<Arc<AppState>>) -> Json<HealthResponse> {
    healthz(state).await
}
