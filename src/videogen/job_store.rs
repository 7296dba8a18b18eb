use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::videogen::profiles::ProviderKind;

/// A submitted upstream job as the proxy tracks it.
///
/// `terminal_url` is written at most once; later polls serve it without
/// contacting the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Proxy-issued id handed to the client
    pub request_id: String,
    /// Provider-assigned id
    pub upstream_id: String,
    pub model_key: String,
    pub provider: ProviderKind,
    /// Upstream URL polled for status
    pub status_url: String,
    /// Upstream result document, when the provider separates it from status
    pub response_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub terminal_url: Option<String>,
    /// Result document of a synchronous submission, which has no upstream job to poll
    pub sync_result: Option<Value>,
}

impl Job {
    pub fn new(
        request_id: impl Into<String>,
        upstream_id: impl Into<String>,
        model_key: impl Into<String>,
        provider: ProviderKind,
        status_url: impl Into<String>,
        response_url: Option<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            upstream_id: upstream_id.into(),
            model_key: model_key.into(),
            provider,
            status_url: status_url.into(),
            response_url,
            created_at: Utc::now(),
            terminal_url: None,
            sync_result: None,
        }
    }

    /// Links worth following when the status document carries no media URL
    pub fn result_hints(&self) -> Vec<String> {
        if self.sync_result.is_some() {
            return Vec::new();
        }
        self.response_url.iter().cloned().collect()
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, request_id: &str) -> Option<Job>;

    async fn get_by_upstream_id(&self, upstream_id: &str) -> Option<Job>;

    /// Inserts `job` unless its request id is taken; returns whether it was inserted
    async fn put_if_absent(&self, job: Job) -> bool;

    /// Sets the terminal URL once. Returns the URL that ends up stored, which
    /// is the earlier one if another writer got there first.
    async fn freeze_url(&self, request_id: &str, url: &str) -> Result<String, AppError>;
}

#[derive(Default)]
struct Jobs {
    by_request: HashMap<String, Job>,
    by_upstream: HashMap<String, String>,
}

/// Process-local store; jobs do not survive a restart
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<Jobs>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, request_id: &str) -> Option<Job> {
        self.jobs.read().await.by_request.get(request_id).cloned()
    }

    async fn get_by_upstream_id(&self, upstream_id: &str) -> Option<Job> {
        let jobs = self.jobs.read().await;
        jobs.by_upstream
            .get(upstream_id)
            .and_then(|request_id| jobs.by_request.get(request_id))
            .cloned()
    }

    async fn put_if_absent(&self, job: Job) -> bool {
        let mut jobs = self.jobs.write().await;
        if jobs.by_request.contains_key(&job.request_id) {
            return false;
        }
        jobs.by_upstream
            .insert(job.upstream_id.clone(), job.request_id.clone());
        jobs.by_request.insert(job.request_id.clone(), job);
        true
    }

    async fn freeze_url(&self, request_id: &str, url: &str) -> Result<String, AppError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .by_request
            .get_mut(request_id)
            .ok_or_else(|| AppError::JobNotFound(request_id.to_string()))?;

        match &job.terminal_url {
            Some(existing) => {
                if existing != url {
                    log::debug!("job {request_id} already frozen, keeping {existing}");
                }
                Ok(existing.clone())
            }
            None => {
                job.terminal_url = Some(url.to_string());
                Ok(url.to_string())
            }
        }
    }
}
