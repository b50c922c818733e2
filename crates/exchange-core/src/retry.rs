//! Retry-with-backoff wrapper shared by every engine venue call.

use crate::error::VenueError;
use common::ExponentialBackoff;
use rate_limit::RateLimitPolicy;
use std::future::Future;
use std::time::Duration;

/// Retry policy for venue calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts before a retriable error escalates to fatal.
    pub max_attempts: u32,
    /// Backoff schedule between attempts.
    pub backoff: ExponentialBackoff,
    /// Longest a call may wait on the local rate-limit budget.
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: ExponentialBackoff::default(),
            max_rate_limit_wait: Duration::from_secs(10),
        }
    }
}

/// Run a venue call with rate limiting and jittered-backoff retries.
///
/// Before every attempt the local budget for `endpoint` is acquired
/// (suspending up to `max_rate_limit_wait`); retriable venue errors are
/// retried up to `max_attempts`, after which the last error escalates to
/// [`VenueError::RetriesExhausted`]. Non-retriable errors surface on the
/// first occurrence.
pub async fn with_retry<F, Fut, T>(
    policy: &RateLimitPolicy,
    endpoint: &str,
    config: &RetryConfig,
    mut call: F,
) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VenueError>>,
{
    let mut backoff = config.backoff.clone();

    for attempt in 0..config.max_attempts {
        if !policy.wait_if_needed(endpoint, config.max_rate_limit_wait).await {
            return Err(VenueError::BudgetExhausted {
                endpoint: endpoint.to_string(),
            });
        }

        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.retriable() => {
                let delay = match &err {
                    // Honor the venue's own reset hint when it is longer
                    // than our schedule.
                    VenueError::RateLimited { retry_after_ms } => {
                        backoff.next_delay().max(Duration::from_millis(*retry_after_ms))
                    }
                    _ => backoff.next_delay(),
                };

                tracing::warn!(
                    endpoint = %endpoint,
                    attempt = attempt + 1,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retriable venue error, backing off"
                );

                if attempt + 1 == config.max_attempts {
                    return Err(VenueError::RetriesExhausted {
                        attempts: config.max_attempts,
                        last: err.to_string(),
                    });
                }
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }

    Err(VenueError::RetriesExhausted {
        attempts: config.max_attempts,
        last: "no attempts made".to_string(),
    })
}
