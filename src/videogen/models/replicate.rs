use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::Submission;
use crate::config::ReplicateConfig;
use crate::error::AppError;

pub fn auth_header(api_token: &str) -> String {
    format!("Token {api_token}")
}

pub fn predictions_url(config: &ReplicateConfig) -> String {
    format!("{}/predictions", config.api_url.trim_end_matches('/'))
}

pub fn prediction_url(config: &ReplicateConfig, prediction_id: &str) -> String {
    format!("{}/{prediction_id}", predictions_url(config))
}

pub fn versions_url(config: &ReplicateConfig, slug: &str) -> String {
    format!("{}/models/{slug}/versions", config.api_url.trim_end_matches('/'))
}

/// Newest version id in a `GET /models/{slug}/versions` listing
pub fn latest_version(listing: &Value) -> Option<String> {
    listing
        .pointer("/results/0/id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Adds `version` (and webhook registration) next to the shaped `input`
pub fn prediction_body(config: &ReplicateConfig, shaped: &Value, version: &str) -> Value {
    let mut body = match shaped {
        Value::Object(fields) if fields.contains_key("input") => shaped.clone(),
        other => json!({ "input": other }),
    };
    if let Some(fields) = body.as_object_mut() {
        fields.insert("version".to_string(), json!(version));
        if let Some(hook) = &config.webhook_url {
            fields.insert(
                "webhook".to_string(),
                json!(format!("{}/replicate/webhook", hook.trim_end_matches('/'))),
            );
            fields.insert("webhook_events_filter".to_string(), json!(["completed"]));
        }
    }
    body
}

pub fn parse_submission(config: &ReplicateConfig, raw: Value) -> Result<Submission, AppError> {
    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("replicate prediction response has no id: {raw}"))?
        .to_string();
    let status_url = raw
        .pointer("/urls/get")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| prediction_url(config, &id));

    Ok(Submission {
        upstream_id: id,
        status_url,
        response_url: None,
        terminal: false,
        raw,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedVersion {
    pub slug: String,
    pub version: String,
}

/// Version ids resolved per model key, kept for the process lifetime
#[derive(Default)]
pub struct VersionCache {
    resolved: RwLock<HashMap<String, ResolvedVersion>>,
}

impl VersionCache {
    pub async fn get(&self, model_key: &str) -> Option<ResolvedVersion> {
        self.resolved.read().await.get(model_key).cloned()
    }

    /// Keeps the first resolution if two requests race
    pub async fn insert(&self, model_key: &str, resolved: ResolvedVersion) -> ResolvedVersion {
        self.resolved
            .write()
            .await
            .entry(model_key.to_string())
            .or_insert(resolved)
            .clone()
    }

    pub async fn snapshot(&self) -> HashMap<String, ResolvedVersion> {
        self.resolved.read().await.clone()
    }
}
