use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

/// Error taxonomy shared by the shaper, upstream client, moderation and handlers
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no credentials configured for {0}")]
    MissingCredentials(String),

    #[error("upstream returned HTTP {status}: {body}")]
    UpstreamHttp { status: u16, body: String },

    #[error("upstream request failed: {0}")]
    UpstreamTransport(String),

    #[error("moderation unavailable: {0}")]
    ModerationUnavailable(String),

    #[error("content rejected by moderation")]
    ContentRejected { categories: Vec<String> },

    #[error("unknown request id: {0}")]
    JobNotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        AppError::InvalidArgument(msg.into())
    }

    /// Transport failures, rate limiting and gateway-style 5xx are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::UpstreamTransport(_) => true,
            AppError::UpstreamHttp { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidArgument(_)
            | AppError::UnknownModel(_)
            | AppError::MissingCredentials(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Configuration(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::UpstreamHttp { status, .. } => match status {
                400 | 404 | 409 | 413 | 422 | 429 => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                _ => StatusCode::BAD_GATEWAY,
            },
            AppError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            AppError::ModerationUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ContentRejected { .. } => StatusCode::FORBIDDEN,
            AppError::JobNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    fn body(&self) -> Value {
        match self {
            AppError::UpstreamHttp { status, body } => json!({
                "error": self.to_string(),
                "upstream_status": status,
                "upstream_body": body,
            }),
            AppError::ContentRejected { categories } => json!({
                "error": self.to_string(),
                "categories": categories,
            }),
            AppError::ModerationUnavailable(_) => json!({
                "error": self.to_string(),
                "retryable": true,
            }),
            _ => json!({ "error": self.to_string() }),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("request failed with {status}: {self}");
        } else {
            log::warn!("request rejected with {status}: {self}");
        }
        (status, Json(self.body())).into_response()
    }
}
