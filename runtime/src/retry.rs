//! Retry logic with exponential backoff.
//!
//! The [`RetryPolicy`] itself lives in `bidstream-core` so that bus
//! implementations can carry one; this module adds the async drivers.
//!
//! # Example
//!
//! ```rust
//! use bidstream_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(3)
//!     .initial_delay(Duration::from_millis(100))
//!     .build();
//!
//! let result = retry_with_backoff(&policy, || async {
//!     Ok::<_, String>("success")
//! }).await?;
//! # Ok(())
//! # }
//! ```

use tokio::time::sleep;

pub use bidstream_core::retry::{RetryPolicy, RetryPolicyBuilder};

/// Retry an async operation with exponential backoff.
///
/// Returns `Ok(T)` if the operation succeeds within the retry limit, or the
/// last error once `policy.max_retries` retries are exhausted.
///
/// # Errors
///
/// Returns the last error from `operation`.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Retry an async operation while `is_retryable` holds for its error.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once the budget
/// is used up.
///
/// # Example
///
/// ```rust
/// use bidstream_runtime::retry::{RetryPolicy, retry_with_predicate};
///
/// # async fn example() -> Result<(), String> {
/// let policy = RetryPolicy::default();
///
/// let result = retry_with_predicate(
///     &policy,
///     || async { Ok::<_, String>(42) },
///     |err: &String| err.contains("transient"),
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retry = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if retry > 0 {
                    tracing::info!(retry, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::warn!(error = %err, "Error is not retryable, failing immediately");
                    return Err(err);
                }

                if retry >= policy.max_retries {
                    tracing::error!(retry, error = %err, "Operation failed after max retries");
                    metrics::counter!("retry_exhausted_total").increment(1);
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(retry);
                tracing::warn!(
                    retry,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );
                metrics::counter!("retry_attempts_total").increment(1);

                sleep(delay).await;
                retry += 1;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build()
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_backoff(&fast_policy(3), || {
            let counter = Arc::clone(&counter_clone);
            async move {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err("transient failure")
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_returns_last_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result: Result<(), String> = retry_with_backoff(&fast_policy(2), || {
            let counter = Arc::clone(&counter_clone);
            async move {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                Err(format!("failure {count}"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), "failure 2");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_fast() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result: Result<(), &str> = retry_with_predicate(
            &fast_policy(5),
            || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("permanent")
                }
            },
            |err| err.contains("transient"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
