//! Bounded retry with exponential backoff for provider calls.
//!
//! Only transient failures are retried: 5xx, 429 and 408 responses, timeouts
//! and connection errors. The same credential is reused for every attempt and
//! nothing is billed until the final outcome is known.

use std::time::Duration;
use tracing::{debug, warn};

use super::ProviderError;
use crate::config::RetryConfig;

// MARK: - Constants

/// Default backoff multiplier.
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

// MARK: - Retry Policy

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff_ms = duration.as_millis() as u64;
        self
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let backoff_ms = (self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent))
            .min(self.max_backoff_ms as f64) as u64;
        Duration::from_millis(backoff_ms)
    }

    /// Whether `error` is transient and `attempt` retries have not yet been used up.
    pub fn should_retry(&self, error: &ProviderError, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        is_transient(error)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Transient upstream failures worth another attempt.
pub fn is_transient(error: &ProviderError) -> bool {
    match error {
        ProviderError::Api { status, .. } => {
            (500..600).contains(status) || *status == 429 || *status == 408
        }
        ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
        _ => false,
    }
}

// MARK: - Retry Executor

/// Run `operation` until it succeeds, fails permanently, or retries run out.
pub async fn execute_provider_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt, "Provider request succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                if !policy.should_retry(&error, attempt) {
                    return Err(error);
                }

                attempt += 1;
                let backoff = policy.calculate_backoff(attempt);

                warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Provider request failed, retrying"
                );

                tokio::time::sleep(backoff).await;
            }
        }
    }
}

// MARK: - Tests
