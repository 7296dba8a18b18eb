use reqwest::Url;
use serde_json::Value;

use super::Submission;
use crate::config::FalConfig;
use crate::error::AppError;
use crate::videogen::profiles::ModelProfile;

pub fn auth_header(api_key: &str) -> String {
    format!("Key {api_key}")
}

/// `{queue_url}/{model_id}` when queueing, `{sync_url}/{model_id}` otherwise.
///
/// Queued submissions register `{webhook_url}/fal/webhook` when a public
/// webhook base is configured.
pub fn submit_url(config: &FalConfig, profile: &ModelProfile) -> Result<String, AppError> {
    let base = if config.use_queue {
        &config.queue_url
    } else {
        &config.sync_url
    };
    let raw = format!("{}/{}", base.trim_end_matches('/'), profile.model_id);
    let mut url = Url::parse(&raw)
        .map_err(|e| AppError::Configuration(format!("invalid fal url '{raw}': {e}")))?;

    if let (true, Some(hook)) = (config.use_queue, &config.webhook_url) {
        url.query_pairs_mut().append_pair(
            "fal_webhook",
            &format!("{}/fal/webhook", hook.trim_end_matches('/')),
        );
    }
    Ok(url.to_string())
}

/// Queue requests are addressed by the two-segment base id, not the full slug
pub fn response_url(config: &FalConfig, profile: &ModelProfile, request_id: &str) -> String {
    format!(
        "{}/{}/requests/{request_id}",
        config.queue_url.trim_end_matches('/'),
        profile.base_model_id()
    )
}

pub fn status_url(config: &FalConfig, profile: &ModelProfile, request_id: &str) -> String {
    format!("{}/status", response_url(config, profile, request_id))
}

/// Reads the queue acknowledgement, or wraps a sync result.
///
/// Sync responses carry no request id, so `fallback_id` stands in for it.
pub fn parse_submission(
    config: &FalConfig,
    profile: &ModelProfile,
    raw: Value,
    fallback_id: &str,
) -> Result<Submission, AppError> {
    let request_id = raw.get("request_id").and_then(Value::as_str);

    if !config.use_queue {
        let upstream_id = request_id.unwrap_or(fallback_id).to_string();
        return Ok(Submission {
            status_url: status_url(config, profile, &upstream_id),
            response_url: None,
            upstream_id,
            terminal: true,
            raw,
        });
    }

    let request_id = request_id
        .ok_or_else(|| {
            anyhow::anyhow!("fal queue acknowledgement for {} has no request_id: {raw}", profile.model_id)
        })?
        .to_string();

    let status = raw
        .get("status_url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| status_url(config, profile, &request_id));
    let response = raw
        .get("response_url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| response_url(config, profile, &request_id));

    Ok(Submission {
        upstream_id: request_id,
        status_url: status,
        response_url: Some(response),
        terminal: false,
        raw,
    })
}
