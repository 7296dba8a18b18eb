//! Job Submission Client: posts shaped payloads to the provider and fetches
//! status and follow-up documents, always returning raw JSON.

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Url};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{AppConfig, FalConfig, ReplicateConfig, UpstreamConfig};
use crate::error::AppError;
use crate::utils::retry::{retry_with_backoff, RetryConfig};
use crate::videogen::models::replicate::{ResolvedVersion, VersionCache};
use crate::videogen::models::{fal, replicate, Submission};
use crate::videogen::normalizer::LinkFetcher;
use crate::videogen::profiles::{ModelProfile, ProviderKind};
use crate::videogen::shaper::{ShapedBody, ShapedPayload};

#[async_trait]
pub trait JobUpstream: Send + Sync {
    /// Sends one shaped payload; `request_id` names the job if the provider answers synchronously
    async fn submit(
        &self,
        profile: &ModelProfile,
        payload: &ShapedPayload,
        request_id: &str,
    ) -> Result<Submission, AppError>;

    async fn fetch_status(&self, status_url: &str) -> Result<Value, AppError>;

    /// Rebuilds the status URL for a job id this process did not submit
    fn status_url_for(&self, profile: &ModelProfile, upstream_id: &str) -> String;

    fn response_url_for(&self, profile: &ModelProfile, upstream_id: &str) -> Option<String>;

    /// Which provider, if any, serves `url`
    fn provider_for_url(&self, url: &str) -> Option<ProviderKind>;

    fn uses_queue(&self) -> bool;

    /// Version ids per model key, pinned or resolved so far
    async fn resolved_versions(&self, profiles: &[&ModelProfile]) -> Map<String, Value>;
}

/// Submission retries only where the provider cannot have accepted the job
pub fn is_retryable_submission(err: &AppError) -> bool {
    matches!(
        err,
        AppError::UpstreamTransport(_) | AppError::UpstreamHttp { status: 429, .. }
    )
}

/// Maps a response to raw JSON; non-JSON bodies are wrapped as `{rawText}`
pub async fn decode_response(response: reqwest::Response) -> Result<Value, AppError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| AppError::UpstreamTransport(e.to_string()))?;

    if !status.is_success() {
        return Err(AppError::UpstreamHttp {
            status: status.as_u16(),
            body: text,
        });
    }
    Ok(serde_json::from_str(&text).unwrap_or_else(|_| json!({ "rawText": text })))
}

fn transport_error(e: reqwest::Error) -> AppError {
    AppError::UpstreamTransport(e.to_string())
}

fn origin_of(url: &str) -> Option<(String, String, Option<u16>)> {
    let url = Url::parse(url).ok()?;
    Some((
        url.scheme().to_string(),
        url.host_str()?.to_ascii_lowercase(),
        url.port_or_known_default(),
    ))
}

fn form_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct HttpUpstream {
    client: Client,
    fal: FalConfig,
    replicate: ReplicateConfig,
    retry: RetryConfig,
    versions: VersionCache,
}

impl HttpUpstream {
    pub fn new(
        fal: FalConfig,
        replicate: ReplicateConfig,
        upstream: &UpstreamConfig,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(upstream.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            fal,
            replicate,
            retry: upstream.retry.clone(),
            versions: VersionCache::default(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        Self::new(
            config.fal.clone(),
            config.replicate.clone(),
            &config.upstream,
        )
    }

    fn auth_header(&self, provider: ProviderKind) -> Result<String, AppError> {
        match provider {
            ProviderKind::Fal => self
                .fal
                .api_key
                .as_deref()
                .map(fal::auth_header)
                .ok_or_else(|| AppError::MissingCredentials("fal".to_string())),
            ProviderKind::Replicate => self
                .replicate
                .api_token
                .as_deref()
                .map(replicate::auth_header)
                .ok_or_else(|| AppError::MissingCredentials("replicate".to_string())),
        }
    }

    /// Attaches credentials only for provider origins, never for CDN links
    fn authorized_get(&self, url: &str) -> Result<RequestBuilder, AppError> {
        let request = self.client.get(url);
        match self.provider_for_url(url) {
            Some(provider) => Ok(request.header("Authorization", self.auth_header(provider)?)),
            None => Ok(request),
        }
    }

    async fn get_json(&self, op_name: &str, url: &str) -> Result<Value, AppError> {
        retry_with_backoff(&self.retry, op_name, AppError::is_retryable, move || async move {
            let response = self
                .authorized_get(url)?
                .send()
                .await
                .map_err(transport_error)?;
            decode_response(response).await
        })
        .await
    }

    async fn post_shaped(
        &self,
        url: &str,
        auth: &str,
        body: &ShapedBody,
    ) -> Result<Value, AppError> {
        retry_with_backoff(&self.retry, "submit", is_retryable_submission, move || async move {
            let request = self.client.post(url).header("Authorization", auth);
            let request = match body {
                ShapedBody::Json(json) => request.json(json),
                ShapedBody::Multipart {
                    fields,
                    file_field,
                    image,
                } => {
                    let part = multipart::Part::bytes(image.bytes.clone())
                        .file_name(image.filename.clone().unwrap_or_else(|| "image".to_string()))
                        .mime_str(&image.mime_type)
                        .map_err(|e| AppError::invalid(format!("invalid image mime type: {e}")))?;
                    let form = fields
                        .iter()
                        .fold(multipart::Form::new(), |form, (name, value)| {
                            form.text(name.clone(), form_value(value))
                        })
                        .part(file_field.clone(), part);
                    request.multipart(form)
                }
            };
            let response = request.send().await.map_err(transport_error)?;
            decode_response(response).await
        })
        .await
    }

    /// Pinned version, else cached, else newest of `model_id` falling back to `fallback_model_id`
    pub async fn resolve_version(&self, profile: &ModelProfile) -> Result<String, AppError> {
        if let Some(version) = &profile.version {
            return Ok(version.clone());
        }
        if let Some(resolved) = self.versions.get(&profile.key).await {
            return Ok(resolved.version);
        }

        let slugs = std::iter::once(&profile.model_id).chain(profile.fallback_model_id.as_ref());
        let mut last_error = None;
        for slug in slugs {
            let url = replicate::versions_url(&self.replicate, slug);
            match self.get_json("list_versions", &url).await {
                Ok(listing) => match replicate::latest_version(&listing) {
                    Some(version) => {
                        info!("model '{}' using {slug} -> {version}", profile.key);
                        let resolved = ResolvedVersion {
                            slug: slug.clone(),
                            version,
                        };
                        return Ok(self.versions.insert(&profile.key, resolved).await.version);
                    }
                    None => {
                        warn!("no versions listed for {slug}");
                        last_error = Some(AppError::Configuration(format!(
                            "no versions available for {slug}"
                        )));
                    }
                },
                Err(e) => {
                    warn!("listing versions for {slug} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AppError::Configuration(format!("model '{}' has no slug to resolve", profile.key))
        }))
    }
}

#[async_trait]
impl JobUpstream for HttpUpstream {
    async fn submit(
        &self,
        profile: &ModelProfile,
        payload: &ShapedPayload,
        request_id: &str,
    ) -> Result<Submission, AppError> {
        let auth = self.auth_header(profile.provider)?;
        match profile.provider {
            ProviderKind::Fal => {
                let url = fal::submit_url(&self.fal, profile)?;
                info!("submitting to fal {url}");
                let raw = self.post_shaped(&url, &auth, &payload.body).await?;
                fal::parse_submission(&self.fal, profile, raw, request_id)
            }
            ProviderKind::Replicate => {
                let ShapedBody::Json(shaped) = &payload.body else {
                    return Err(AppError::Configuration(format!(
                        "model '{}' produced a multipart body for replicate",
                        profile.key
                    )));
                };
                let version = self.resolve_version(profile).await?;
                let body = replicate::prediction_body(&self.replicate, shaped, &version);
                let url = replicate::predictions_url(&self.replicate);
                info!("submitting to replicate {url} with version {version}");
                let raw = self.post_shaped(&url, &auth, &ShapedBody::Json(body)).await?;
                replicate::parse_submission(&self.replicate, raw)
            }
        }
    }

    async fn fetch_status(&self, status_url: &str) -> Result<Value, AppError> {
        self.get_json("fetch_status", status_url).await
    }

    fn status_url_for(&self, profile: &ModelProfile, upstream_id: &str) -> String {
        match profile.provider {
            ProviderKind::Fal => fal::status_url(&self.fal, profile, upstream_id),
            ProviderKind::Replicate => replicate::prediction_url(&self.replicate, upstream_id),
        }
    }

    fn response_url_for(&self, profile: &ModelProfile, upstream_id: &str) -> Option<String> {
        match profile.provider {
            ProviderKind::Fal => Some(fal::response_url(&self.fal, profile, upstream_id)),
            ProviderKind::Replicate => None,
        }
    }

    fn provider_for_url(&self, url: &str) -> Option<ProviderKind> {
        let origin = origin_of(url)?;
        let known = [
            (&self.fal.queue_url, ProviderKind::Fal),
            (&self.fal.sync_url, ProviderKind::Fal),
            (&self.replicate.api_url, ProviderKind::Replicate),
        ];
        known
            .into_iter()
            .find(|(base, _)| origin_of(base).as_ref() == Some(&origin))
            .map(|(_, provider)| provider)
    }

    fn uses_queue(&self) -> bool {
        self.fal.use_queue
    }

    async fn resolved_versions(&self, profiles: &[&ModelProfile]) -> Map<String, Value> {
        let cached = self.versions.snapshot().await;
        profiles
            .iter()
            .filter(|profile| profile.provider == ProviderKind::Replicate)
            .filter_map(|profile| {
                let entry = match (&profile.version, cached.get(&profile.key)) {
                    (Some(version), _) => json!({ "slug": profile.model_id, "version": version }),
                    (None, Some(resolved)) => json!(resolved),
                    (None, None) => return None,
                };
                Some((profile.key.clone(), entry))
            })
            .collect()
    }
}

#[async_trait]
impl LinkFetcher for HttpUpstream {
    async fn fetch_link(&self, url: &str) -> Result<Value, AppError> {
        self.get_json("fetch_follow_up", url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::videogen::profiles::tests::{fal_image_profile, fal_text_profile, replicate_image_profile};
    use crate::videogen::shaper::shape_request;
    use crate::videogen::types::{GenerationRequest, ImagePayload};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> UpstreamConfig {
        UpstreamConfig {
            timeout_secs: 5,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                multiplier: 2.0,
            },
        }
    }

    fn upstream_for(server: &MockServer) -> HttpUpstream {
        let fal = FalConfig {
            api_key: Some("fal-key".to_string()),
            queue_url: server.uri(),
            sync_url: format!("{}/sync", server.uri()),
            use_queue: true,
            webhook_url: None,
        };
        let replicate = ReplicateConfig {
            api_token: Some("r8-token".to_string()),
            api_url: format!("{}/v1", server.uri()),
            ..ReplicateConfig::default()
        };
        HttpUpstream::new(fal, replicate, &fast_retry()).unwrap()
    }

    fn text_payload(profile: &ModelProfile) -> ShapedPayload {
        shape_request(&GenerationRequest::text(&profile.key, "a fox"), profile, "image_url").unwrap()
    }

    #[tokio::test]
    async fn test_fal_submit_sends_key_and_nested_body() {
        let server = MockServer::start().await;
        let profile = fal_text_profile();
        Mock::given(method("POST"))
            .and(path("/fal-ai/wan/v2.2-a14b/text-to-video"))
            .and(header("Authorization", "Key fal-key"))
            .and(body_json(json!({"input": {"prompt": "a fox", "fps": 24}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"request_id": "req-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let upstream = upstream_for(&server);
        let submission = upstream
            .submit(&profile, &text_payload(&profile), "local")
            .await
            .unwrap();

        assert_eq!(submission.upstream_id, "req-1");
        assert_eq!(
            submission.status_url,
            format!("{}/fal-ai/wan/requests/req-1/status", server.uri())
        );
    }

    #[tokio::test]
    async fn test_upstream_error_keeps_status_and_body() {
        let server = MockServer::start().await;
        let profile = fal_text_profile();
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(422).set_body_string(r#"{"detail":"fps must be one of 24"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = upstream_for(&server)
            .submit(&profile, &text_payload(&profile), "local")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::UpstreamHttp { status: 422, ref body } if body.contains("fps must be one of 24")
        ));
    }

    #[tokio::test]
    async fn test_submit_retries_rate_limit_but_not_server_errors() {
        let server = MockServer::start().await;
        let profile = fal_text_profile();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"request_id": "req-2"})))
            .mount(&server)
            .await;

        let upstream = upstream_for(&server);
        let submission = upstream
            .submit(&profile, &text_payload(&profile), "local")
            .await
            .unwrap();
        assert_eq!(submission.upstream_id, "req-2");

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        let err = upstream_for(&server)
            .submit(&profile, &text_payload(&profile), "local")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UpstreamHttp { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_status_poll_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fal-ai/veo2/requests/abc/status"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fal-ai/veo2/requests/abc/status"))
            .and(header("Authorization", "Key fal-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "IN_PROGRESS"})))
            .mount(&server)
            .await;

        let upstream = upstream_for(&server);
        let url = upstream.status_url_for(&fal_image_profile(), "abc");
        let doc = upstream.fetch_status(&url).await.unwrap();
        assert_eq!(doc["status"], "IN_PROGRESS");
    }

    #[tokio::test]
    async fn test_credential_rejection_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let upstream = upstream_for(&server);
        let url = upstream.status_url_for(&fal_image_profile(), "abc");
        let err = upstream.fetch_status(&url).await.unwrap_err();
        assert!(matches!(err, AppError::UpstreamHttp { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_non_json_body_is_wrapped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>done</html>"))
            .mount(&server)
            .await;

        let upstream = upstream_for(&server);
        let doc = upstream
            .fetch_status(&format!("{}/anything", server.uri()))
            .await
            .unwrap();
        assert_eq!(doc, json!({"rawText": "<html>done</html>"}));
    }

    #[tokio::test]
    async fn test_replicate_version_falls_back_and_is_cached() {
        let server = MockServer::start().await;
        let mut profile = replicate_image_profile();
        profile.version = None;

        Mock::given(method("GET"))
            .and(path("/v1/models/pixverse/pixverse-v5/versions"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/models/pixverse/pixverse-v4.5/versions"))
            .and(header("Authorization", "Token r8-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"results": [{"id": "v45"}]})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "pred-1"})))
            .expect(2)
            .mount(&server)
            .await;

        let upstream = upstream_for(&server);
        let image = ImagePayload {
            bytes: vec![1, 2, 3],
            mime_type: "image/png".to_string(),
            filename: None,
        };
        let payload = shape_request(
            &GenerationRequest::image(&profile.key, "spin", image),
            &profile,
            "input_image",
        )
        .unwrap();

        for _ in 0..2 {
            let submission = upstream.submit(&profile, &payload, "local").await.unwrap();
            assert_eq!(submission.upstream_id, "pred-1");
            assert_eq!(
                submission.status_url,
                format!("{}/v1/predictions/pred-1", server.uri())
            );
        }

        let versions = upstream.resolved_versions(&[&profile]).await;
        assert_eq!(versions[&profile.key], json!({"slug": "pixverse/pixverse-v4.5", "version": "v45"}));
    }

    #[tokio::test]
    async fn test_fal_webhook_query_param() {
        let server = MockServer::start().await;
        let profile = fal_text_profile();
        Mock::given(method("POST"))
            .and(query_param("fal_webhook", "https://proxy.example/fal/webhook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"request_id": "req-3"})))
            .expect(1)
            .mount(&server)
            .await;

        let mut upstream = upstream_for(&server);
        upstream.fal.webhook_url = Some("https://proxy.example".to_string());
        upstream
            .submit(&profile, &text_payload(&profile), "local")
            .await
            .unwrap();
    }

    #[test]
    fn test_provider_origin_matching() {
        let fal = FalConfig {
            api_key: Some("k".into()),
            ..FalConfig::default()
        };
        let upstream = HttpUpstream::new(fal, ReplicateConfig::default(), &fast_retry()).unwrap();
        assert_eq!(
            upstream.provider_for_url("https://queue.fal.run/fal-ai/veo2/requests/1"),
            Some(ProviderKind::Fal)
        );
        assert_eq!(
            upstream.provider_for_url("https://api.replicate.com/v1/predictions/1"),
            Some(ProviderKind::Replicate)
        );
        assert_eq!(upstream.provider_for_url("https://evil.example/queue.fal.run"), None);
        assert_eq!(upstream.provider_for_url("not a url"), None);
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let upstream =
            HttpUpstream::new(FalConfig::default(), ReplicateConfig::default(), &fast_retry())
                .unwrap();
        let profile = fal_text_profile();
        let err = upstream
            .submit(&profile, &text_payload(&profile), "local")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MissingCredentials(_)));
    }
}
