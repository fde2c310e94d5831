use std::future::Future;
use std::time::Duration;

use concord_core::{AppError, HttpConfig};
use tokio::time::sleep;

/// Delay before retry number `attempt` (1-based) after `err`.
///
/// Rate limiting backs off exponentially, other transient failures linearly.
pub fn backoff_delay(config: &HttpConfig, err: &AppError, attempt: u32) -> Duration {
    match err {
        AppError::RateLimitExceeded => config.retry_base_delay * 2_u32.saturating_pow(attempt),
        _ => config.retry_base_delay * attempt,
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or
/// `config.max_attempts` attempts have been made.
///
/// Only errors for which [`AppError::is_retryable`] holds are retried; any
/// other error is returned unchanged on the first occurrence. When attempts
/// run out the last error is returned.
///
/// # Examples
///
/// ```
/// use concord_client::with_retry;
/// use concord_core::{AppError, HttpConfig};
///
/// # async fn example() -> Result<(), AppError> {
/// let config = HttpConfig::default();
/// let value = with_retry(&config, "answer", || async { Ok::<_, AppError>(42) }).await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn with_retry<T, F, Fut>(
    config: &HttpConfig,
    description: &str,
    mut operation: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = backoff_delay(config, &err, attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    status = ?err.status(),
                    error = %err,
                    "{} failed, retrying in {:?}",
                    description,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::warn!(attempts = attempt, error = %err, "{} gave up", description);
                }
                return Err(err);
            }
        }
    }
}
