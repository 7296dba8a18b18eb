use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::consts::REDACTED_PLACEHOLDER;

/// Bodies larger than this are truncated before they reach a breadcrumb
const DEFAULT_BODY_LIMIT: usize = 10 * 1024;

/// Field names whose values are credentials
const SENSITIVE_FIELD_NAMES: &[&str] = &[
    "authorization",
    "api_key",
    "api_token",
    "token",
    "secret",
    "password",
];

/// Field names that carry image payloads
const MEDIA_FIELD_NAMES: &[&str] = &["image", "image_url", "input_image", "start_image"];

const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie", "x-api-key"];

static DATA_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"data:[A-Za-z0-9.+/-]+;base64,[A-Za-z0-9+/=]+").expect("static regex is valid")
});

fn get_body_limit() -> usize {
    std::env::var("HTTP_LOG_BODY_LIMIT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_BODY_LIMIT)
}

fn is_logging_enabled() -> bool {
    std::env::var("HTTP_LOG_ENABLED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(true)
}

/// Multipart uploads are never buffered; they are image bytes
fn should_capture_body(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => ct.contains("json") || ct.starts_with("text/"),
        None => false,
    }
}

/// Records each request as a Sentry breadcrumb.
/// Bodies are only captured, scrubbed and attached for responses >= 400.
pub async fn http_logging_middleware(
    req: Request,
    next: Next,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if !is_logging_enabled() {
        return Ok(next.run(req).await);
    }

    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_headers = extract_safe_headers(req.headers());

    let (req, request_body) = if should_capture_body(content_type(req.headers())) {
        let (parts, body) = req.into_parts();
        let bytes = buffer_body(body).await.map_err(|e| {
            log::warn!("Failed to buffer request body: {e}");
            (StatusCode::BAD_REQUEST, "Failed to read request body".to_string())
        })?;
        let preview = truncated(&bytes);
        (Request::from_parts(parts, Body::from(bytes)), preview)
    } else {
        (req, None)
    };

    let res = next.run(req).await;
    let status = res.status();
    let duration_ms = start.elapsed().as_millis() as u64;

    if status.as_u16() < 400 {
        add_lightweight_breadcrumb(method.as_str(), &path, status.as_u16(), duration_ms);
        return Ok(res);
    }

    let response_headers = extract_safe_headers(res.headers());
    let (res, response_body) = if should_capture_body(content_type(res.headers())) {
        let (parts, body) = res.into_parts();
        let bytes = buffer_body(body).await.map_err(|e| {
            log::warn!("Failed to buffer response body: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to process response".to_string(),
            )
        })?;
        let preview = truncated(&bytes);
        (Response::from_parts(parts, Body::from(bytes)), preview)
    } else {
        (res, None)
    };

    add_request_breadcrumb(
        method.as_str(),
        &path,
        &request_headers,
        request_body.as_ref().and_then(parse_and_scrub_bytes).as_deref(),
    );
    add_response_breadcrumb(
        status.as_u16(),
        duration_ms,
        &response_headers,
        response_body.as_ref().and_then(parse_and_scrub_bytes).as_deref(),
    );

    Ok(res)
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
}

async fn buffer_body(body: Body) -> Result<Bytes, axum::Error> {
    Ok(body.collect().await?.to_bytes())
}

fn truncated(bytes: &Bytes) -> Option<Bytes> {
    let limit = get_body_limit();
    match bytes.len() {
        0 => None,
        len if len > limit => Some(bytes.slice(0..limit)),
        _ => Some(bytes.clone()),
    }
}

fn parse_and_scrub_bytes(bytes: &Bytes) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    match std::str::from_utf8(bytes) {
        Ok(body) => Some(scrub_body(body)),
        Err(_) => Some(format!("[Binary data, {} bytes]", bytes.len())),
    }
}

fn extract_safe_headers(headers: &HeaderMap) -> BTreeMap<String, Value> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_lowercase();
            if SENSITIVE_HEADERS.contains(&name.as_str()) {
                Some((name, json!(REDACTED_PLACEHOLDER)))
            } else {
                value.to_str().ok().map(|v| (name, json!(v)))
            }
        })
        .collect()
}

fn add_lightweight_breadcrumb(method: &str, path: &str, status: u16, duration_ms: u64) {
    let mut data = BTreeMap::new();
    data.insert("method".to_string(), json!(method));
    data.insert("url".to_string(), json!(path));
    data.insert("status_code".to_string(), json!(status));
    data.insert("duration_ms".to_string(), json!(duration_ms));

    sentry::add_breadcrumb(sentry::Breadcrumb {
        ty: "http".to_string(),
        category: Some("http.request".to_string()),
        message: Some(format!("{method} {path} {status} ({duration_ms}ms)")),
        data: data.into_iter().collect(),
        level: sentry::Level::Info,
        ..Default::default()
    });
}

fn add_request_breadcrumb(
    method: &str,
    path: &str,
    headers: &BTreeMap<String, Value>,
    body_preview: Option<&str>,
) {
    let mut data = BTreeMap::new();
    data.insert("method".to_string(), json!(method));
    data.insert("url".to_string(), json!(path));
    if !headers.is_empty() {
        data.insert("headers".to_string(), json!(headers));
    }
    if let Some(body) = body_preview {
        data.insert("body".to_string(), json!(body));
    }

    sentry::add_breadcrumb(sentry::Breadcrumb {
        ty: "http".to_string(),
        category: Some("http.request".to_string()),
        message: Some(format!("{method} {path}")),
        data: data.into_iter().collect(),
        level: sentry::Level::Info,
        ..Default::default()
    });
}

fn add_response_breadcrumb(
    status: u16,
    duration_ms: u64,
    headers: &BTreeMap<String, Value>,
    body_preview: Option<&str>,
) {
    let mut data = BTreeMap::new();
    data.insert("status_code".to_string(), json!(status));
    data.insert("duration_ms".to_string(), json!(duration_ms));
    if !headers.is_empty() {
        data.insert("headers".to_string(), json!(headers));
    }
    if let Some(body) = body_preview {
        data.insert("body".to_string(), json!(body));
    }

    let level = if status >= 500 {
        sentry::Level::Error
    } else {
        sentry::Level::Warning
    };

    sentry::add_breadcrumb(sentry::Breadcrumb {
        ty: "http".to_string(),
        category: Some("http.response".to_string()),
        message: Some(format!("HTTP {status} ({duration_ms}ms)")),
        data: data.into_iter().collect(),
        level,
        ..Default::default()
    });
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_FIELD_NAMES.iter().any(|field| key.contains(field))
}

fn is_media_key(key: &str) -> bool {
    MEDIA_FIELD_NAMES.contains(&key.to_lowercase().as_str())
}

/// Redacts credentials, image fields and inline data URIs.
/// Non-JSON bodies (and truncated JSON) only get the data URI pass.
pub fn scrub_body(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(mut value) => {
            scrub_json_value(&mut value);
            serde_json::to_string(&value).unwrap_or_else(|_| "[Failed to serialize]".to_string())
        }
        Err(_) => DATA_URI.replace_all(body, REDACTED_PLACEHOLDER).into_owned(),
    }
}

fn scrub_json_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                if is_sensitive_key(key) || (is_media_key(key) && field.is_string()) {
                    *field = json!(REDACTED_PLACEHOLDER);
                } else {
                    scrub_json_value(field);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(scrub_json_value),
        Value::String(s) if s.starts_with("data:") => *s = REDACTED_PLACEHOLDER.to_string(),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};
    use tower::ServiceExt;

    #[test]
    fn test_scrub_json_body() {
        let body = r#"{"prompt":"a fox","input":{"image_url":"data:image/png;base64,iVBORw0KGgo=","api_key":"sk-1"},"frames":[{"start_image":"https://cdn/x.png"}]}"#;
        let scrubbed: Value = serde_json::from_str(&scrub_body(body)).unwrap();

        assert_eq!(scrubbed["prompt"], "a fox");
        assert_eq!(scrubbed["input"]["image_url"], REDACTED_PLACEHOLDER);
        assert_eq!(scrubbed["input"]["api_key"], REDACTED_PLACEHOLDER);
        assert_eq!(scrubbed["frames"][0]["start_image"], REDACTED_PLACEHOLDER);
    }

    #[test]
    fn test_data_uri_in_unrelated_field_is_scrubbed() {
        let scrubbed: Value =
            serde_json::from_str(&scrub_body(r#"{"reference":"data:image/jpeg;base64,/9j/4AAQ"}"#))
                .unwrap();
        assert_eq!(scrubbed["reference"], REDACTED_PLACEHOLDER);
    }

    #[test]
    fn test_truncated_body_falls_back_to_pattern() {
        let body = r#"{"input":{"image_url":"data:image/png;base64,iVBORw0KGgoAAAA"#;
        let scrubbed = scrub_body(body);
        assert!(!scrubbed.contains("iVBOR"));
        assert!(scrubbed.contains(REDACTED_PLACEHOLDER));
    }

    #[test]
    fn test_safe_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Key abc".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let safe = extract_safe_headers(&headers);
        assert_eq!(safe["authorization"], REDACTED_PLACEHOLDER);
        assert_eq!(safe["content-type"], "application/json");
    }

    #[test]
    fn test_should_capture_body() {
        assert!(should_capture_body(Some("application/json")));
        assert!(should_capture_body(Some("text/plain; charset=utf-8")));
        assert!(!should_capture_body(Some("multipart/form-data; boundary=x")));
        assert!(!should_capture_body(None));
    }

    #[tokio::test]
    async fn test_middleware_preserves_bodies() {
        let app = Router::new()
            .route(
                "/echo",
                post(|body: String| async move { (StatusCode::UNPROCESSABLE_ENTITY, body) }),
            )
            .layer(axum::middleware::from_fn(http_logging_middleware));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"prompt":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], br#"{"prompt":"x"}"#);
    }
}
