use std::future::Future;
use std::time::Duration;

use crate::config::MaintenanceSettings;
use crate::error::{AppError, Result};

/// Fixed-interval retry policy
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            attempts: 3,
        }
    }
}

impl From<&MaintenanceSettings> for RetryPolicy {
    fn from(settings: &MaintenanceSettings) -> Self {
        Self {
            interval: settings.retry_interval,
            attempts: settings.retry_attempts,
        }
    }
}

/// Runs `action` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts
///
/// Only `AppError::Retryable` is retried; anything else is returned as is.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut action: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last = String::from("no attempts made");
    for attempt in 1..=policy.attempts {
        match action().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    attempt,
                    max_attempts = policy.attempts,
                    error = %e,
                    "Retryable failure"
                );
                last = e.to_string();
                tokio::time::sleep(policy.interval).await;
            }
            Err(e) => return Err(e),
        }
    }

    Err(AppError::OutOfRetries {
        attempts: policy.attempts,
        last,
    })
}
