//! Maps heterogeneous provider status and result documents onto
//! `(NormalizedStatus, Option<video url>)`.
//!
//! URL discovery runs an ordered list of [`UrlExtractor`]s and stops at the
//! first hit: prioritized structured fields, then follow-up links to
//! secondary documents, then a pattern scan of the serialized text.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::consts::{MAX_FOLLOW_UP_LINKS, VIDEO_EXTENSIONS};
use crate::error::AppError;
use crate::videogen::types::NormalizedStatus;

/// Objects that commonly wrap the payload, scanned below the root
const WRAPPERS: &[&str] = &[
    "response", "result", "data", "payload", "output", "outputs", "media", "videos",
];

/// How many wrapper levels below the root are scanned
const WRAPPER_DEPTH: usize = 2;

/// Candidate URL locations, most trusted first. `[]` visits every array element.
const URL_FIELD_PRIORITY: &[&str] = &[
    "video_url",
    "video.url",
    "video",
    "videos[].url",
    "videos[]",
    "output[].url",
    "media[].url",
    "output",
    "output[]",
    "url",
    "video.video_url",
    "mp4",
];

/// Fields pointing at a secondary document that holds the result
const FOLLOW_UP_FIELDS: &[&str] = &["response_url", "result_url", "output_url"];

static URL_FIELD_PATHS: Lazy<Vec<FieldPath>> =
    Lazy::new(|| URL_FIELD_PRIORITY.iter().map(|p| FieldPath::parse(p)).collect());

static URL_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>\\]+"#).expect("static regex is valid"));

#[derive(Debug, Clone, Copy)]
struct Segment {
    key: &'static str,
    each: bool,
}

#[derive(Debug, Clone)]
struct FieldPath(Vec<Segment>);

impl FieldPath {
    fn parse(path: &'static str) -> Self {
        FieldPath(
            path.split('.')
                .map(|part| match part.strip_suffix("[]") {
                    Some(key) => Segment { key, each: true },
                    None => Segment {
                        key: part,
                        each: false,
                    },
                })
                .collect(),
        )
    }

    fn resolve<'v>(&self, scope: &'v Value, out: &mut Vec<&'v Value>) {
        let mut current = vec![scope];
        for segment in &self.0 {
            let mut next = Vec::new();
            for value in current {
                match value.get(segment.key) {
                    Some(Value::Array(items)) if segment.each => next.extend(items.iter()),
                    Some(found) => next.push(found),
                    None => {}
                }
            }
            current = next;
        }
        out.extend(current);
    }
}

/// Whether a provider-reported status string is fed in or must be assumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeMode {
    /// Status-check response; a missing status means the job has not started
    StatusPoll,
    /// Terminal result (sync response, webhook, result fetch); a missing status means completed
    TerminalResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub status: NormalizedStatus,
    pub video_url: Option<String>,
    /// Name of the extractor that produced `video_url`
    pub strategy: Option<&'static str>,
}

/// Maps a provider status word onto the closed status set.
///
/// Unrecognized words map to `InQueue`: provider vocabularies are not
/// contractually stable and an unknown word must not fail the poll.
pub fn map_status(raw: &str) -> NormalizedStatus {
    let word = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    match word.as_str() {
        "succeeded" | "success" | "successful" | "completed" | "complete" | "done"
        | "finished" | "ok" => NormalizedStatus::Completed,
        "failed" | "failure" | "error" | "errored" | "canceled" | "cancelled" | "aborted"
        | "timeout" | "timed_out" => NormalizedStatus::Failed,
        "starting" | "started" | "processing" | "in_progress" | "running" | "generating" => {
            NormalizedStatus::InProgress
        }
        "queued" | "in_queue" | "pending" | "submitted" | "waiting" => NormalizedStatus::InQueue,
        _ => {
            debug!("unrecognized upstream status '{raw}', treating as queued");
            NormalizedStatus::InQueue
        }
    }
}

/// Raw status string at the root, else inside a `response` wrapper
pub fn find_status(doc: &Value) -> Option<&str> {
    doc.get("status")
        .and_then(Value::as_str)
        .or_else(|| doc.pointer("/response/status").and_then(Value::as_str))
}

pub fn extract_status(doc: &Value, mode: NormalizeMode) -> NormalizedStatus {
    match (find_status(doc), mode) {
        (Some(raw), _) => map_status(raw),
        (None, NormalizeMode::StatusPoll) => NormalizedStatus::InQueue,
        (None, NormalizeMode::TerminalResult) => NormalizedStatus::Completed,
    }
}

/// Absolute http(s) URL with a host
pub fn valid_media_url(candidate: &str) -> Option<String> {
    let candidate = candidate.trim();
    let url = Url::parse(candidate).ok()?;
    let has_host = url.host_str().is_some_and(|h| !h.is_empty());
    (matches!(url.scheme(), "http" | "https") && has_host).then(|| candidate.to_string())
}

fn scopes(root: &Value) -> Vec<&Value> {
    let mut all = vec![root];
    let mut frontier = vec![root];
    for _ in 0..WRAPPER_DEPTH {
        let mut next = Vec::new();
        for scope in frontier {
            let Value::Object(map) = scope else {
                continue;
            };
            for wrapper in WRAPPERS {
                match map.get(*wrapper) {
                    Some(inner @ Value::Object(_)) => next.push(inner),
                    Some(Value::Array(items)) => next.extend(items.iter().filter(|i| i.is_object())),
                    _ => {}
                }
            }
        }
        all.extend(next.iter().copied());
        frontier = next;
    }
    all
}

/// Prioritized structured scan of one document.
///
/// Field priority dominates nesting: a higher-priority field in a wrapper
/// beats a lower-priority one at the root.
pub fn scan_structured(doc: &Value) -> Option<String> {
    let scopes = scopes(doc);
    let mut leaves = Vec::new();
    for path in URL_FIELD_PATHS.iter() {
        for scope in &scopes {
            leaves.clear();
            path.resolve(scope, &mut leaves);
            if let Some(url) = leaves
                .iter()
                .filter_map(|leaf| leaf.as_str())
                .find_map(valid_media_url)
            {
                return Some(url);
            }
        }
    }
    None
}

/// Last resort: any absolute URL in the serialized text ending in a video extension
pub fn scan_text_for_video(doc: &Value) -> Option<String> {
    let text = match doc {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    URL_TOKEN.find_iter(&text).find_map(|m| {
        let token = m.as_str().trim_end_matches(['.', ',', ';', ')', ']', '}']);
        let url = Url::parse(token).ok()?;
        let path = url.path().to_ascii_lowercase();
        let is_video = VIDEO_EXTENSIONS
            .iter()
            .any(|ext| path.ends_with(&format!(".{ext}")));
        is_video.then(|| token.to_string())
    })
}

/// Secondary-document links in `doc`, in discovery order
pub fn follow_up_links(doc: &Value) -> Vec<String> {
    let mut links = Vec::new();
    let containers = [Some(doc), doc.get("response")];
    for container in containers.into_iter().flatten() {
        for field in FOLLOW_UP_FIELDS {
            if let Some(url) = container.get(*field).and_then(Value::as_str) {
                links.extend(valid_media_url(url));
            }
        }
        if let Some(Value::Array(items)) = container.get("links") {
            for item in items {
                let href = item
                    .as_str()
                    .or_else(|| item.get("href").and_then(Value::as_str))
                    .or_else(|| item.get("url").and_then(Value::as_str));
                links.extend(href.and_then(valid_media_url));
            }
        }
    }
    links
}

/// Fetches a follow-up document; implemented by the upstream client
#[async_trait]
pub trait LinkFetcher: Send + Sync {
    async fn fetch_link(&self, url: &str) -> Result<Value, AppError>;
}

/// Documents gathered while extracting; the first is the polled response
pub struct ExtractionContext {
    pub documents: Vec<Value>,
    /// Follow-up links known out of band (e.g. a `response_url` from submission)
    pub hints: Vec<String>,
}

impl ExtractionContext {
    pub fn new(raw: &Value, hints: &[String]) -> Self {
        Self {
            documents: vec![raw.clone()],
            hints: hints.to_vec(),
        }
    }
}

#[async_trait]
pub trait UrlExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, ctx: &mut ExtractionContext) -> Option<String>;
}

pub struct StructuredFieldExtractor;

#[async_trait]
impl UrlExtractor for StructuredFieldExtractor {
    fn name(&self) -> &'static str {
        "structured_fields"
    }

    async fn extract(&self, ctx: &mut ExtractionContext) -> Option<String> {
        ctx.documents.first().and_then(scan_structured)
    }
}

/// Follows result links breadth-first, each URL at most once
pub struct FollowUpLinkExtractor {
    fetcher: Arc<dyn LinkFetcher>,
    max_links: usize,
}

impl FollowUpLinkExtractor {
    pub fn new(fetcher: Arc<dyn LinkFetcher>, max_links: usize) -> Self {
        Self { fetcher, max_links }
    }
}

#[async_trait]
impl UrlExtractor for FollowUpLinkExtractor {
    fn name(&self) -> &'static str {
        "follow_up_links"
    }

    async fn extract(&self, ctx: &mut ExtractionContext) -> Option<String> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let initial = ctx
            .documents
            .first()
            .map(follow_up_links)
            .unwrap_or_default();
        for link in initial.into_iter().chain(ctx.hints.iter().cloned()) {
            if visited.insert(link.clone()) {
                queue.push_back(link);
            }
        }

        let mut fetched = 0;
        while let Some(link) = queue.pop_front() {
            if fetched == self.max_links {
                warn!("follow-up link budget exhausted, skipping {link}");
                break;
            }
            fetched += 1;

            let doc = match self.fetcher.fetch_link(&link).await {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("failed to fetch follow-up link {link}: {e}");
                    continue;
                }
            };

            if let Some(url) = scan_structured(&doc) {
                return Some(url);
            }
            for next in follow_up_links(&doc) {
                if visited.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
            ctx.documents.push(doc);
        }
        None
    }
}

pub struct VideoPatternExtractor;

#[async_trait]
impl UrlExtractor for VideoPatternExtractor {
    fn name(&self) -> &'static str {
        "video_pattern"
    }

    async fn extract(&self, ctx: &mut ExtractionContext) -> Option<String> {
        ctx.documents.iter().find_map(scan_text_for_video)
    }
}

/// Ordered extractor pipeline
pub struct ResultNormalizer {
    extractors: Vec<Box<dyn UrlExtractor>>,
}

impl ResultNormalizer {
    pub fn new(fetcher: Arc<dyn LinkFetcher>) -> Self {
        Self::with_extractors(vec![
            Box::new(StructuredFieldExtractor),
            Box::new(FollowUpLinkExtractor::new(fetcher, MAX_FOLLOW_UP_LINKS)),
            Box::new(VideoPatternExtractor),
        ])
    }

    /// Pipeline without network access: structured fields, then text pattern
    #[cfg(test)]
    pub fn offline() -> Self {
        Self::with_extractors(vec![
            Box::new(StructuredFieldExtractor),
            Box::new(VideoPatternExtractor),
        ])
    }

    pub fn with_extractors(extractors: Vec<Box<dyn UrlExtractor>>) -> Self {
        Self { extractors }
    }

    /// Resolves status and, only for completed jobs, the media URL.
    ///
    /// A completed job without any discoverable URL yields
    /// `(Completed, None)`; it is never demoted to `Failed`.
    pub async fn normalize(&self, raw: &Value, mode: NormalizeMode, hints: &[String]) -> Normalized {
        let status = extract_status(raw, mode);
        if status != NormalizedStatus::Completed {
            return Normalized {
                status,
                video_url: None,
                strategy: None,
            };
        }

        let mut ctx = ExtractionContext::new(raw, hints);
        for extractor in &self.extractors {
            if let Some(url) = extractor.extract(&mut ctx).await {
                debug!("video url found by {}", extractor.name());
                return Normalized {
                    status,
                    video_url: Some(url),
                    strategy: Some(extractor.name()),
                };
            }
        }

        warn!("job completed but no video url could be found in the response");
        Normalized {
            status,
            video_url: None,
            strategy: None,
        }
    }
}
