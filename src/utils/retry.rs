use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::AppError;

/// Bounded exponential backoff for outbound collaborator calls
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    4_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    fn next_delay(&self, delay: Duration) -> Duration {
        let next = (delay.as_millis() as f64) * self.multiplier;
        Duration::from_millis(next.min(self.max_delay_ms as f64) as u64)
    }
}

/// Runs `op` until it succeeds, returns a non-retryable error, or attempts run out.
///
/// `should_retry` decides per error; callers that must not repeat side effects
/// (job submission) pass a narrower predicate than [`AppError::is_retryable`].
pub async fn retry_with_backoff<T, F, Fut, P>(
    config: &RetryConfig,
    op_name: &str,
    should_retry: P,
    mut op: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
    P: Fn(&AppError) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = Duration::from_millis(config.initial_delay_ms);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && should_retry(&e) => {
                warn!("{op_name} attempt {attempt}/{max_attempts} failed: {e}. Retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay = config.next_delay(delay);
            }
            Err(e) => return Err(e),
        }
    }
}
