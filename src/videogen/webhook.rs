use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::instrument;

use crate::app_state::AppState;
use crate::error::AppError;
use crate::videogen::orchestrator;
use crate::videogen::webhook_signature::{verify_webhook_signature, WebhookHeaders};

fn parse_payload(body: &Bytes) -> Result<Value, AppError> {
    serde_json::from_slice(body).map_err(|e| AppError::invalid(format!("invalid webhook payload: {e}")))
}

/// Fal posts `request_id`; requests routed through its gateway carry `gateway_request_id`
fn fal_job_id(payload: &Value) -> Option<&str> {
    ["request_id", "gateway_request_id"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .filter(|id| !id.is_empty())
}

fn replicate_job_id(payload: &Value) -> Option<&str> {
    payload
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Fal completion callback.
///
/// Fal callbacks are unsigned here, so the body only names the job; the
/// result is read back from the job's stored status URL.
#[utoipa::path(
    post,
    path = "/webhook",
    responses(
        (status = 200, description = "Callback accepted"),
        (status = 400, description = "Body is not JSON"),
    ),
    tag = "Webhooks"
)]
#[instrument(skip(state, body))]
pub async fn fal_webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let payload = parse_payload(&body)?;
    match fal_job_id(&payload) {
        Some(id) => {
            orchestrator::refresh_from_webhook(&state, id).await;
        }
        None => log::warn!("fal webhook without a job id, ignoring"),
    }
    Ok(Json(json!({ "ok": true })))
}

/// Replicate prediction callback, accepted only with a valid signature
#[utoipa::path(
    post,
    path = "/webhook",
    responses(
        (status = 200, description = "Callback accepted"),
        (status = 400, description = "Body is not JSON"),
        (status = 401, description = "Missing or invalid signature"),
    ),
    tag = "Webhooks"
)]
#[instrument(skip(state, headers, body))]
pub async fn replicate_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let Some(secret) = state.replicate_webhook_secret.as_deref() else {
        return Err(AppError::Unauthorized(
            "replicate webhook signing secret is not configured".to_string(),
        ));
    };
    let webhook_headers = WebhookHeaders::from_http_headers(&headers)?;
    verify_webhook_signature(&webhook_headers, &body, secret)?;

    let payload = parse_payload(&body)?;
    match replicate_job_id(&payload) {
        Some(id) => {
            orchestrator::complete_from_webhook(&state, id, &payload).await;
        }
        None => log::warn!("replicate webhook without a job id, ignoring"),
    }
    Ok(Json(json!({ "ok": true })))
}
