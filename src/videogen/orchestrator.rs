//! Submit and poll flows: shaping, moderation, submission, normalization and
//! the write-once URL cache, in that order.

use reqwest::Url;
use serde_json::Value;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::error::AppError;
use crate::videogen::job_store::Job;
use crate::videogen::models::Submission;
use crate::videogen::normalizer::{NormalizeMode, Normalized};
use crate::videogen::profiles::ModelProfile;
use crate::videogen::shaper::{shape_request, ShapedPayload};
use crate::videogen::types::{
    GenerationKind, GenerationRequest, NormalizedStatus, QueuedResponse, ResultResponse,
};

const RESULT_PATH: &str = "/video/result";

const PUBLIC_URL_HINT: &str =
    "Hint: this model may require a public image URL instead of an inline upload";

pub fn result_path(request_id: &str) -> String {
    format!("{RESULT_PATH}/{request_id}")
}

pub async fn submit_generation(
    state: &AppState,
    request: GenerationRequest,
) -> Result<QueuedResponse, AppError> {
    let profile = state.profiles.get(&request.model_key)?;
    let fields: Vec<&str> = match request.kind {
        GenerationKind::ImageToVideo => profile.image_fields.iter().map(String::as_str).collect(),
        GenerationKind::TextToVideo => vec![""],
    };
    let Some((&first_field, other_fields)) = fields.split_first() else {
        return Err(AppError::Configuration(format!(
            "model '{}' lists no image fields",
            profile.key
        )));
    };

    // Input errors are reported before moderation gets a say
    let payload = shape_request(&request, profile, first_field)?;
    state.moderator.check_prompt(&request.prompt).await?;

    let overridden = payload.overridden.clone();
    let request_id = uuid::Uuid::new_v4().to_string();
    let submission = submit_with_field_fallback(
        state,
        &request,
        profile,
        &request_id,
        (first_field, payload),
        other_fields,
    )
    .await?;

    let mut response = QueuedResponse {
        status: NormalizedStatus::InQueue,
        request_id: request_id.clone(),
        status_url: result_path(&request_id),
        response_url: result_path(&request_id),
        job_id: submission.upstream_id.clone(),
        video_url: None,
        overridden,
        raw: None,
    };

    let mut job = Job::new(
        &request_id,
        &submission.upstream_id,
        &profile.key,
        profile.provider,
        &submission.status_url,
        submission.response_url.clone(),
    );
    let normalized = if submission.terminal {
        let normalized = state
            .normalizer
            .normalize(&submission.raw, NormalizeMode::TerminalResult, &[])
            .await;
        // No provider-side request exists to poll later
        job.sync_result = Some(submission.raw.clone());
        Some(normalized)
    } else {
        None
    };

    state.jobs.put_if_absent(job).await;
    info!(
        "job {request_id} submitted to {:?} as {} ({})",
        profile.provider, submission.upstream_id, profile.key
    );

    if let Some(normalized) = normalized {
        response.status = normalized.status;
        if let Some(url) = normalized.video_url {
            response.video_url = Some(freeze_completed_url(state, &request_id, url).await);
        }
        response.raw = Some(submission.raw);
    }

    Ok(response)
}

/// Tries each configured image parameter name until the provider accepts one.
///
/// `first` is the already shaped payload for the first name. Only 400/422
/// rejections move on to the next name; anything else is final.
async fn submit_with_field_fallback<'f>(
    state: &AppState,
    request: &GenerationRequest,
    profile: &ModelProfile,
    request_id: &str,
    first: (&'f str, ShapedPayload),
    other_fields: &[&'f str],
) -> Result<Submission, AppError> {
    let (mut field, mut payload) = first;
    let mut remaining = other_fields.iter();
    loop {
        match state.upstream.submit(profile, &payload, request_id).await {
            Ok(submission) => return Ok(submission),
            Err(AppError::UpstreamHttp { status, body })
                if request.kind == GenerationKind::ImageToVideo && matches!(status, 400 | 422) =>
            {
                let Some(next) = remaining.next() else {
                    return Err(AppError::UpstreamHttp {
                        status,
                        body: format!("{body} | {PUBLIC_URL_HINT}"),
                    });
                };
                warn!("{} rejected image field '{field}' ({status}), trying '{next}'", profile.key);
                field = *next;
                payload = shape_request(request, profile, field)?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Persists (when configured) and freezes a completed URL, returning the URL to serve.
///
/// A failed persist serves the upstream URL without freezing it so the next
/// poll tries again.
async fn freeze_completed_url(state: &AppState, request_id: &str, url: String) -> String {
    let durable = match &state.blob_store {
        Some(store) => match store.persist(&url, request_id).await {
            Ok(durable) => durable,
            Err(e) => {
                warn!("persisting {url} for job {request_id} failed, not caching: {e}");
                return url;
            }
        },
        None => url,
    };

    match state.jobs.freeze_url(request_id, &durable).await {
        Ok(winner) => winner,
        Err(e) => {
            warn!("could not cache url for job {request_id}: {e}");
            durable
        }
    }
}

/// Looks up a job, or rebuilds one from `model_key` for ids submitted before a restart
async fn find_or_rebuild_job(
    state: &AppState,
    request_id: &str,
    model_key: Option<&str>,
) -> Result<Job, AppError> {
    if let Some(job) = state.jobs.get(request_id).await {
        return Ok(job);
    }
    let Some(model_key) = model_key else {
        return Err(AppError::JobNotFound(request_id.to_string()));
    };

    let profile = state.profiles.get(model_key)?;
    info!("rebuilding poll reference for {request_id} from model {model_key}");
    let job = Job::new(
        request_id,
        request_id,
        &profile.key,
        profile.provider,
        state.upstream.status_url_for(profile, request_id),
        state.upstream.response_url_for(profile, request_id),
    );
    state.jobs.put_if_absent(job.clone()).await;
    Ok(state.jobs.get(request_id).await.unwrap_or(job))
}

pub async fn poll_result(
    state: &AppState,
    request_id: &str,
    model_key: Option<&str>,
) -> Result<ResultResponse, AppError> {
    let job = find_or_rebuild_job(state, request_id, model_key).await?;

    if let Some(url) = job.terminal_url {
        return Ok(ResultResponse {
            status: NormalizedStatus::Completed,
            request_id: Some(job.request_id),
            video_url: Some(url),
            raw: None,
        });
    }

    // Sync results are re-read from the stored document, there is nothing upstream to poll
    let (raw, mode) = match &job.sync_result {
        Some(doc) => (doc.clone(), NormalizeMode::TerminalResult),
        None => (
            state.upstream.fetch_status(&job.status_url).await?,
            NormalizeMode::StatusPoll,
        ),
    };
    let normalized = state
        .normalizer
        .normalize(&raw, mode, &job.result_hints())
        .await;
    log_transition(&job, &normalized, "poll");

    let video_url = match normalized.video_url {
        Some(url) => Some(freeze_completed_url(state, &job.request_id, url).await),
        None => None,
    };

    Ok(ResultResponse {
        status: normalized.status,
        request_id: Some(job.request_id),
        video_url,
        raw: Some(raw),
    })
}

fn log_transition(job: &Job, normalized: &Normalized, source: &str) {
    if !normalized.status.is_terminal() {
        return;
    }
    let elapsed = chrono::Utc::now() - job.created_at;
    info!(
        "job {} ({} on {:?}) is {} after {}s via {source}, url from {}",
        job.request_id,
        job.model_key,
        job.provider,
        normalized.status,
        elapsed.num_seconds(),
        normalized.strategy.unwrap_or("nothing"),
    );
}

/// Where a client-supplied `status_url` points
#[derive(Debug, PartialEq, Eq)]
enum StatusTarget {
    /// One of our own `/video/result/{id}` paths
    Job(String),
    /// A provider status URL
    Upstream(String),
}

fn classify_status_url(state: &AppState, status_url: &str) -> Result<StatusTarget, AppError> {
    let last_segment = |path: &str| {
        path.trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    };

    match Url::parse(status_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            if state.upstream.provider_for_url(status_url).is_some() {
                return Ok(StatusTarget::Upstream(status_url.to_string()));
            }
            if url.path().starts_with(&format!("{RESULT_PATH}/")) {
                if let Some(id) = last_segment(url.path()) {
                    return Ok(StatusTarget::Job(id));
                }
            }
            Err(AppError::invalid(
                "status_url must point at this service or a configured provider",
            ))
        }
        Ok(_) => Err(AppError::invalid("status_url must be http(s)")),
        Err(_) => {
            let path = status_url.split(['?', '#']).next().unwrap_or_default();
            last_segment(path)
                .map(StatusTarget::Job)
                .ok_or_else(|| AppError::invalid("status_url has no request id"))
        }
    }
}

pub async fn poll_status_url(
    state: &AppState,
    status_url: &str,
    model_key: Option<&str>,
) -> Result<ResultResponse, AppError> {
    match classify_status_url(state, status_url)? {
        StatusTarget::Job(request_id) => poll_result(state, &request_id, model_key).await,
        StatusTarget::Upstream(url) => {
            let raw = state.upstream.fetch_status(&url).await?;
            let normalized = state
                .normalizer
                .normalize(&raw, NormalizeMode::StatusPoll, &[])
                .await;
            Ok(ResultResponse {
                status: normalized.status,
                request_id: None,
                video_url: normalized.video_url,
                raw: Some(raw),
            })
        }
    }
}

/// Applies a verified provider completion callback. Unknown jobs are ignored.
pub async fn complete_from_webhook(
    state: &AppState,
    upstream_id: &str,
    raw: &Value,
) -> Option<ResultResponse> {
    let Some(job) = state.jobs.get_by_upstream_id(upstream_id).await else {
        info!("webhook for unknown upstream job {upstream_id}, ignoring");
        return None;
    };

    let normalized = state
        .normalizer
        .normalize(raw, NormalizeMode::TerminalResult, &job.result_hints())
        .await;
    log_transition(&job, &normalized, "webhook");
    let video_url = match normalized.video_url {
        Some(url) => Some(freeze_completed_url(state, &job.request_id, url).await),
        None => None,
    };

    Some(ResultResponse {
        status: normalized.status,
        request_id: Some(job.request_id),
        video_url,
        raw: None,
    })
}

/// Treats an unverified callback as a hint: the job is polled at its stored
/// status URL and the callback body itself is ignored.
pub async fn refresh_from_webhook(state: &AppState, upstream_id: &str) -> Option<ResultResponse> {
    let Some(job) = state.jobs.get_by_upstream_id(upstream_id).await else {
        info!("webhook for unknown upstream job {upstream_id}, ignoring");
        return None;
    };

    match poll_result(state, &job.request_id, None).await {
        Ok(result) => Some(result),
        Err(e) => {
            warn!("refreshing job {} after webhook failed: {e}", job.request_id);
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{AppConfig, ModerationPolicy};
    use crate::utils::gcs::BlobStore;
    use crate::videogen::job_store::{InMemoryJobStore, JobStore};
    use crate::videogen::normalizer::LinkFetcher;
    use crate::videogen::profiles::tests::{fal_image_profile, fal_text_profile, replicate_image_profile};
    use crate::videogen::profiles::{ProfileRegistry, ProviderKind};
    use crate::videogen::prompt_moderation::{ModerationClient, ModerationVerdict, PromptModerator};
    use crate::videogen::shaper::{ShapedBody, ShapedPayload};
    use crate::videogen::types::ImagePayload;
    use crate::videogen::upstream::JobUpstream;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    /// Scripted provider: queued submit results and status documents per URL
    #[derive(Default)]
    pub struct FakeUpstream {
        pub submit_results: Mutex<VecDeque<Result<Submission, AppError>>>,
        pub submitted: Mutex<Vec<Value>>,
        pub status_docs: Mutex<HashMap<String, Value>>,
        pub status_calls: Mutex<Vec<String>>,
    }

    impl FakeUpstream {
        pub fn queue_submission(&self, result: Result<Submission, AppError>) {
            self.submit_results.lock().unwrap().push_back(result);
        }

        pub fn set_status(&self, url: &str, doc: Value) {
            self.status_docs.lock().unwrap().insert(url.to_string(), doc);
        }

        pub fn status_calls(&self) -> usize {
            self.status_calls.lock().unwrap().len()
        }
    }

    pub fn accepted(upstream_id: &str) -> Submission {
        Submission {
            upstream_id: upstream_id.to_string(),
            status_url: format!("https://queue.fal.run/fal-ai/veo2/requests/{upstream_id}/status"),
            response_url: Some(format!("https://queue.fal.run/fal-ai/veo2/requests/{upstream_id}")),
            terminal: false,
            raw: json!({"request_id": upstream_id}),
        }
    }

    #[async_trait]
    impl JobUpstream for FakeUpstream {
        async fn submit(
            &self,
            _profile: &ModelProfile,
            payload: &ShapedPayload,
            _request_id: &str,
        ) -> Result<Submission, AppError> {
            if let ShapedBody::Json(body) = &payload.body {
                self.submitted.lock().unwrap().push(body.clone());
            }
            self.submit_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(accepted("default")))
        }

        async fn fetch_status(&self, status_url: &str) -> Result<Value, AppError> {
            self.status_calls.lock().unwrap().push(status_url.to_string());
            self.status_docs
                .lock()
                .unwrap()
                .get(status_url)
                .cloned()
                .ok_or(AppError::UpstreamHttp {
                    status: 404,
                    body: "no such request".to_string(),
                })
        }

        fn status_url_for(&self, profile: &ModelProfile, upstream_id: &str) -> String {
            format!("https://queue.fal.run/{}/requests/{upstream_id}/status", profile.base_model_id())
        }

        fn response_url_for(&self, _profile: &ModelProfile, _upstream_id: &str) -> Option<String> {
            None
        }

        fn provider_for_url(&self, url: &str) -> Option<ProviderKind> {
            url.starts_with("https://queue.fal.run/").then_some(ProviderKind::Fal)
        }

        fn uses_queue(&self) -> bool {
            true
        }

        async fn resolved_versions(&self, _profiles: &[&ModelProfile]) -> Map<String, Value> {
            Map::new()
        }
    }

    #[async_trait]
    impl LinkFetcher for FakeUpstream {
        async fn fetch_link(&self, url: &str) -> Result<Value, AppError> {
            self.fetch_status(url).await
        }
    }

    pub struct StaticModeration(pub Result<ModerationVerdict, ()>);

    #[async_trait]
    impl ModerationClient for StaticModeration {
        async fn classify(&self, _text: &str) -> Result<ModerationVerdict, AppError> {
            self.0
                .clone()
                .map_err(|_| AppError::UpstreamTransport("moderation timed out".to_string()))
        }
    }

    struct FailingBlobStore;

    #[async_trait]
    impl BlobStore for FailingBlobStore {
        async fn persist(&self, _source_url: &str, _job_id: &str) -> Result<String, AppError> {
            Err(AppError::UpstreamTransport("bucket unreachable".to_string()))
        }
    }

    struct CopyingBlobStore;

    #[async_trait]
    impl BlobStore for CopyingBlobStore {
        async fn persist(&self, _source_url: &str, job_id: &str) -> Result<String, AppError> {
            Ok(format!("https://storage.googleapis.com/bucket/videos/{job_id}.mp4"))
        }
    }

    pub fn test_state_with(
        upstream: Arc<FakeUpstream>,
        moderator: PromptModerator,
        blob_store: Option<Arc<dyn BlobStore>>,
    ) -> AppState {
        let config = AppConfig::from_toml(
            r#"
            default_text_model = "fal-wan-t2v"
            default_image_model = "fal-veo2-i2v"
            [replicate]
            webhook_secret = "whsec_dGVzdC1zaWduaW5nLWtleQ=="
            "#,
        )
        .unwrap();
        let profiles = ProfileRegistry::new(vec![
            fal_text_profile(),
            fal_image_profile(),
            replicate_image_profile(),
        ])
        .unwrap();
        AppState::with_parts(
            &config,
            profiles,
            upstream.clone(),
            upstream,
            Arc::new(InMemoryJobStore::new()),
            moderator,
            blob_store,
        )
    }

    pub fn test_state(upstream: Arc<FakeUpstream>) -> AppState {
        test_state_with(upstream, PromptModerator::new(None, ModerationPolicy::FailOpen), None)
    }

    fn jpeg() -> ImagePayload {
        ImagePayload {
            bytes: vec![0xFF, 0xD8, 0xFF],
            mime_type: "image/jpeg".to_string(),
            filename: None,
        }
    }

    #[tokio::test]
    async fn test_submit_returns_proxy_poll_paths() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.queue_submission(Ok(accepted("fal-1")));
        let state = test_state(upstream);

        let response = submit_generation(&state, GenerationRequest::text("fal-wan-t2v", "a fox"))
            .await
            .unwrap();

        assert_eq!(response.status, NormalizedStatus::InQueue);
        assert_eq!(response.job_id, "fal-1");
        assert_eq!(response.status_url, format!("/video/result/{}", response.request_id));
        assert!(response.overridden.is_empty());
        let job = state.jobs.get(&response.request_id).await.unwrap();
        assert_eq!(job.upstream_id, "fal-1");
        assert_eq!(job.sync_result, None);
    }

    #[tokio::test]
    async fn test_unknown_model_fails_before_network() {
        let upstream = Arc::new(FakeUpstream::default());
        let state = test_state(upstream.clone());
        let err = submit_generation(&state, GenerationRequest::text("nope", "a fox"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnknownModel(_)));
        assert!(upstream.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_image_field_fallback_then_hint() {
        let upstream = Arc::new(FakeUpstream::default());
        let rejected = || {
            Err(AppError::UpstreamHttp {
                status: 422,
                body: "input_image is not a valid field".to_string(),
            })
        };
        upstream.queue_submission(rejected());
        upstream.queue_submission(Ok(accepted("pred-1")));
        let state = test_state(upstream.clone());

        let request = GenerationRequest::image("replicate-pixverse", "spin", jpeg());
        let response = submit_generation(&state, request.clone()).await.unwrap();
        assert_eq!(response.job_id, "pred-1");
        {
            let submitted = upstream.submitted.lock().unwrap();
            assert!(submitted[0]["input"].get("input_image").is_some());
            assert!(submitted[1]["input"].get("image").is_some());
        }

        upstream.queue_submission(rejected());
        upstream.queue_submission(rejected());
        let err = submit_generation(&state, request).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::UpstreamHttp { status: 422, ref body } if body.contains("public image URL")
        ));
    }

    #[tokio::test]
    async fn test_sync_result_is_completed_immediately() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.queue_submission(Ok(Submission {
            terminal: true,
            raw: json!({"video": {"url": "https://v3.fal.media/out.mp4"}}),
            ..accepted("sync-1")
        }));
        let state = test_state(upstream.clone());

        let response = submit_generation(&state, GenerationRequest::text("fal-wan-t2v", "a fox"))
            .await
            .unwrap();
        assert_eq!(response.status, NormalizedStatus::Completed);
        assert_eq!(response.video_url.as_deref(), Some("https://v3.fal.media/out.mp4"));
        assert!(response.raw.is_some());

        let polled = poll_result(&state, &response.request_id, None).await.unwrap();
        assert_eq!(polled.video_url.as_deref(), Some("https://v3.fal.media/out.mp4"));
        assert_eq!(upstream.status_calls(), 0);
    }

    #[tokio::test]
    async fn test_sync_result_without_url_is_not_polled_upstream() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.queue_submission(Ok(Submission {
            terminal: true,
            raw: json!({"status": "COMPLETED", "seed": 42}),
            ..accepted("sync-2")
        }));
        let state = test_state(upstream.clone());

        let response = submit_generation(&state, GenerationRequest::text("fal-wan-t2v", "a fox"))
            .await
            .unwrap();
        assert_eq!(response.status, NormalizedStatus::Completed);
        assert_eq!(response.video_url, None);

        let polled = poll_result(&state, &response.request_id, None).await.unwrap();
        assert_eq!(polled.status, NormalizedStatus::Completed);
        assert_eq!(polled.video_url, None);
        assert_eq!(upstream.status_calls(), 0);
    }

    #[tokio::test]
    async fn test_input_errors_precede_moderation() {
        let upstream = Arc::new(FakeUpstream::default());
        let moderator = PromptModerator::new(
            Some(Arc::new(StaticModeration(Err(())))),
            ModerationPolicy::FailClosed,
        );
        let state = test_state_with(upstream.clone(), moderator, None);

        let oversized = ImagePayload {
            bytes: vec![0u8; 6 * 1024 * 1024],
            ..jpeg()
        };
        let err = submit_generation(&state, GenerationRequest::image("fal-veo2-i2v", "zoom", oversized))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge(_)));

        let err = submit_generation(&state, GenerationRequest::text("fal-veo2-i2v", "zoom"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        // A well-formed request does reach the unavailable moderator
        let err = submit_generation(&state, GenerationRequest::image("fal-veo2-i2v", "zoom", jpeg()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ModerationUnavailable(_)));
        assert!(upstream.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flagged_prompt_never_reaches_provider() {
        let upstream = Arc::new(FakeUpstream::default());
        let verdict = ModerationVerdict {
            flagged: true,
            categories: [("violence".to_string(), true)].into_iter().collect(),
            ..ModerationVerdict::default()
        };
        let moderator = PromptModerator::new(
            Some(Arc::new(StaticModeration(Ok(verdict)))),
            ModerationPolicy::FailOpen,
        );
        let state = test_state_with(upstream.clone(), moderator, None);

        let err = submit_generation(&state, GenerationRequest::text("fal-wan-t2v", "gore"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ContentRejected { .. }));
        assert!(upstream.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poll_freezes_first_url() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.queue_submission(Ok(accepted("fal-2")));
        let state = test_state(upstream.clone());
        let submitted = submit_generation(&state, GenerationRequest::text("fal-wan-t2v", "a fox"))
            .await
            .unwrap();
        let status_url = "https://queue.fal.run/fal-ai/veo2/requests/fal-2/status";

        upstream.set_status(status_url, json!({"status": "IN_PROGRESS"}));
        let first = poll_result(&state, &submitted.request_id, None).await.unwrap();
        assert_eq!(first.status, NormalizedStatus::InProgress);
        assert_eq!(first.video_url, None);

        upstream.set_status(
            status_url,
            json!({"status": "COMPLETED", "video": {"url": "https://x/first.mp4"}}),
        );
        let second = poll_result(&state, &submitted.request_id, None).await.unwrap();
        assert_eq!(second.video_url.as_deref(), Some("https://x/first.mp4"));

        upstream.set_status(
            status_url,
            json!({"status": "COMPLETED", "video": {"url": "https://x/second.mp4"}}),
        );
        let third = poll_result(&state, &submitted.request_id, None).await.unwrap();
        assert_eq!(third.video_url.as_deref(), Some("https://x/first.mp4"));
        assert_eq!(upstream.status_calls(), 2);
    }

    #[tokio::test]
    async fn test_poll_follows_response_hint() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.queue_submission(Ok(accepted("fal-3")));
        let state = test_state(upstream.clone());
        let submitted = submit_generation(&state, GenerationRequest::text("fal-wan-t2v", "a fox"))
            .await
            .unwrap();

        upstream.set_status(
            "https://queue.fal.run/fal-ai/veo2/requests/fal-3/status",
            json!({"status": "COMPLETED"}),
        );
        upstream.set_status(
            "https://queue.fal.run/fal-ai/veo2/requests/fal-3",
            json!({"video": {"url": "https://x/hinted.mp4"}}),
        );
        let result = poll_result(&state, &submitted.request_id, None).await.unwrap();
        assert_eq!(result.video_url.as_deref(), Some("https://x/hinted.mp4"));
    }

    #[tokio::test]
    async fn test_failed_persist_is_retried_on_next_poll() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.queue_submission(Ok(accepted("fal-4")));
        let state = test_state_with(
            upstream.clone(),
            PromptModerator::new(None, ModerationPolicy::FailOpen),
            Some(Arc::new(FailingBlobStore)),
        );
        let submitted = submit_generation(&state, GenerationRequest::text("fal-wan-t2v", "a fox"))
            .await
            .unwrap();
        upstream.set_status(
            "https://queue.fal.run/fal-ai/veo2/requests/fal-4/status",
            json!({"status": "COMPLETED", "video_url": "https://x/raw.mp4"}),
        );

        let result = poll_result(&state, &submitted.request_id, None).await.unwrap();
        assert_eq!(result.video_url.as_deref(), Some("https://x/raw.mp4"));
        let job = state.jobs.get(&submitted.request_id).await.unwrap();
        assert_eq!(job.terminal_url, None);
    }

    #[tokio::test]
    async fn test_persisted_url_is_what_gets_frozen() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.queue_submission(Ok(accepted("fal-5")));
        let state = test_state_with(
            upstream.clone(),
            PromptModerator::new(None, ModerationPolicy::FailOpen),
            Some(Arc::new(CopyingBlobStore)),
        );
        let submitted = submit_generation(&state, GenerationRequest::text("fal-wan-t2v", "a fox"))
            .await
            .unwrap();
        upstream.set_status(
            "https://queue.fal.run/fal-ai/veo2/requests/fal-5/status",
            json!({"status": "COMPLETED", "video_url": "https://x/raw.mp4"}),
        );

        let result = poll_result(&state, &submitted.request_id, None).await.unwrap();
        let expected = format!(
            "https://storage.googleapis.com/bucket/videos/{}.mp4",
            submitted.request_id
        );
        assert_eq!(result.video_url.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_unknown_id_needs_model_to_rebuild() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.set_status(
            "https://queue.fal.run/fal-ai/veo2/requests/old-1/status",
            json!({"status": "IN_QUEUE"}),
        );
        let state = test_state(upstream);

        let err = poll_result(&state, "old-1", None).await.unwrap_err();
        assert!(matches!(err, AppError::JobNotFound(_)));

        let result = poll_result(&state, "old-1", Some("fal-veo2-i2v")).await.unwrap();
        assert_eq!(result.status, NormalizedStatus::InQueue);
    }

    #[tokio::test]
    async fn test_status_url_classification() {
        let state = test_state(Arc::new(FakeUpstream::default()));
        assert_eq!(
            classify_status_url(&state, "/video/result/abc").unwrap(),
            StatusTarget::Job("abc".to_string())
        );
        assert_eq!(
            classify_status_url(&state, "https://proxy.example/video/result/abc?x=1").unwrap(),
            StatusTarget::Job("abc".to_string())
        );
        assert_eq!(
            classify_status_url(&state, "https://queue.fal.run/fal-ai/veo2/requests/1/status")
                .unwrap(),
            StatusTarget::Upstream(
                "https://queue.fal.run/fal-ai/veo2/requests/1/status".to_string()
            )
        );
        assert!(matches!(
            classify_status_url(&state, "https://evil.example/steal"),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_webhook_freezes_known_job() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.queue_submission(Ok(accepted("fal-6")));
        let state = test_state(upstream.clone());
        let submitted = submit_generation(&state, GenerationRequest::text("fal-wan-t2v", "a fox"))
            .await
            .unwrap();

        let payload = json!({
            "request_id": "fal-6",
            "status": "OK",
            "payload": {"video": {"url": "https://x/hook.mp4"}}
        });
        let result = complete_from_webhook(&state, "fal-6", &payload).await.unwrap();
        assert_eq!(result.status, NormalizedStatus::Completed);

        let polled = poll_result(&state, &submitted.request_id, None).await.unwrap();
        assert_eq!(polled.video_url.as_deref(), Some("https://x/hook.mp4"));
        assert_eq!(upstream.status_calls(), 0);

        assert!(complete_from_webhook(&state, "unknown", &payload).await.is_none());
    }
}
