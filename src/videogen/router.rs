use axum::extract::DefaultBodyLimit;
use axum::Router;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    app_state::AppState,
    consts::MAX_MULTIPART_BODY_BYTES,
    videogen::{handlers, webhook},
};

const MAX_WEBHOOK_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(OpenApi)]
#[openapi(
    tags(
        (name = "VideoGen", description = "Text and image to video generation"),
        (name = "Webhooks", description = "Provider completion callbacks"),
        (name = "Health", description = "Liveness and configuration"),
    )
)]
pub struct ApiDoc;

/// Generation and result routes, nested under `/video`
pub fn videogen_router<S>(state: Arc<AppState>) -> OpenApiRouter<S> {
    OpenApiRouter::new()
        .routes(routes!(handlers::generate_text))
        .routes(routes!(handlers::generate_image))
        .routes(routes!(handlers::get_result))
        .routes(routes!(handlers::get_result_by_status_url))
        .layer(DefaultBodyLimit::max(MAX_MULTIPART_BODY_BYTES))
        .with_state(state)
}

pub fn health_router<S>(state: Arc<AppState>) -> OpenApiRouter<S> {
    OpenApiRouter::new()
        .routes(routes!(handlers::healthz))
        .routes(routes!(handlers::root))
        .with_state(state)
}

pub fn fal_webhook_router<S>(state: Arc<AppState>) -> OpenApiRouter<S> {
    OpenApiRouter::new()
        .routes(routes!(webhook::fal_webhook))
        .layer(RequestBodyLimitLayer::new(MAX_WEBHOOK_BODY_BYTES))
        .with_state(state)
}

pub fn replicate_webhook_router<S>(state: Arc<AppState>) -> OpenApiRouter<S> {
    OpenApiRouter::new()
        .routes(routes!(webhook::replicate_webhook))
        .layer(RequestBodyLimitLayer::new(MAX_WEBHOOK_BODY_BYTES))
        .with_state(state)
}

/// Every route plus the swagger UI, without the outer middleware stack
pub fn build_router(state: Arc<AppState>) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .merge(health_router(state.clone()))
        .nest("/video", videogen_router(state.clone()))
        .nest("/fal", fal_webhook_router(state.clone()))
        .nest("/replicate", replicate_webhook_router(state))
        .split_for_parts();

    router.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", api))
}
