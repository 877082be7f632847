//! Transport-level retry with bounded exponential backoff
//!
//! This sits beneath the attempt loop: a transient network failure on a model
//! or version-control call is retried here and never costs an attempt.

use crate::{ChatMessage, ModelClient, ModelError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure, in milliseconds
    pub base_interval_ms: u64,
    /// Upper bound on any single delay, in milliseconds
    pub max_backoff_ms: u64,
    /// Cap on the doubling exponent
    pub max_exponent: u32,
    /// Retries after the initial call; 0 disables retry
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 500,
            max_backoff_ms: 10_000,
            max_exponent: 4,
            max_retries: 3,
        }
    }
}

impl BackoffConfig {
    #[must_use]
    pub fn new(base_interval_ms: u64, max_backoff_ms: u64, max_exponent: u32, max_retries: u32) -> Self {
        Self {
            base_interval_ms,
            max_backoff_ms,
            max_exponent,
            max_retries,
        }
    }

    /// No retries at all
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Millisecond-scale delays for tests
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            base_interval_ms: 1,
            max_backoff_ms: 2,
            max_exponent: 1,
            max_retries,
        }
    }
}

/// Delay before retrying after `consecutive_failures` failures
///
/// `min(base * 2^min(n-1, max_exponent), max_backoff)`
#[must_use]
pub fn calculate_backoff(config: &BackoffConfig, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return Duration::from_millis(config.base_interval_ms.min(config.max_backoff_ms));
    }
    let exponent = consecutive_failures.saturating_sub(1).min(config.max_exponent);
    let delay_ms = config
        .base_interval_ms
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(config.max_backoff_ms);
    Duration::from_millis(delay_ms)
}

/// Run `op` until it succeeds, fails permanently, or retries run out
pub async fn retry_transport<T, E, F, Fut>(
    config: &BackoffConfig,
    operation: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) && failures < config.max_retries => {
                failures += 1;
                let delay = calculate_backoff(config, failures);
                tracing::warn!(
                    "{} failed ({}), retry {}/{} in {:?}",
                    operation,
                    err,
                    failures,
                    config.max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Wraps a client so retryable transport failures are retried transparently
#[derive(Debug, Clone)]
pub struct RetryingClient<C> {
    inner: C,
    backoff: BackoffConfig,
}

impl<C> RetryingClient<C> {
    #[must_use]
    pub fn new(inner: C) -> Self {
        Self::with_backoff(inner, BackoffConfig::default())
    }

    #[must_use]
    pub fn with_backoff(inner: C, backoff: BackoffConfig) -> Self {
        Self { inner, backoff }
    }

    #[must_use]
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: ModelClient> ModelClient for RetryingClient<C> {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatMessage, ModelError> {
        retry_transport(&self.backoff, "model completion", ModelError::is_retryable, || {
            self.inner.complete(messages)
        })
        .await
    }
}
