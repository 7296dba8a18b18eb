use sentry::protocol::{Event, Request as SentryRequest};
use std::sync::Arc;

use crate::consts::REDACTED_PLACEHOLDER;

/// Field names that hold provider credentials or image payloads
const SENSITIVE_FIELDS: &[&str] = &[
    "authorization",
    "api_key",
    "api_token",
    "fal_key",
    "token",
    "secret",
    "password",
    "signature",
    "image_url",
    "input_image",
];

fn is_sensitive_field(field_name: &str) -> bool {
    let field_lower = field_name.to_lowercase();
    SENSITIVE_FIELDS
        .iter()
        .any(|sensitive| field_lower.contains(sensitive))
}

fn contains_sensitive_data(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("data:image/") || SENSITIVE_FIELDS.iter().any(|field| lower.contains(field))
}

/// Drops credentials and inline images from events before they leave the process
pub fn scrub_sensitive_data(mut event: Event<'static>) -> Option<Event<'static>> {
    if let Some(request) = &mut event.request {
        scrub_request(request);
    }

    event.extra.retain(|key, _| !is_sensitive_field(key));

    for context in event.contexts.values_mut() {
        if let sentry::protocol::Context::Other(map) = context {
            map.retain(|key, _| !is_sensitive_field(key));
        }
    }

    for breadcrumb in event.breadcrumbs.values.iter_mut() {
        breadcrumb.data.retain(|key, _| !is_sensitive_field(key));
    }

    Some(event)
}

fn scrub_request(request: &mut SentryRequest) {
    for (name, value) in request.headers.iter_mut() {
        if is_sensitive_field(name) {
            *value = REDACTED_PLACEHOLDER.to_string();
        }
    }

    // Signed provider URLs can carry tokens in the query string
    if let Some(query_string) = &request.query_string {
        if contains_sensitive_data(query_string) {
            request.query_string = Some(REDACTED_PLACEHOLDER.to_string());
        }
    }

    if let Some(data) = &request.data {
        if contains_sensitive_data(data) {
            request.data = Some(format!("{REDACTED_PLACEHOLDER} (contains sensitive data)"));
        }
    }
}

/// `before_send` hook for `sentry::ClientOptions`
pub fn create_before_send() -> Arc<dyn Fn(Event<'static>) -> Option<Event<'static>> + Send + Sync> {
    Arc::new(scrub_sensitive_data)
}
