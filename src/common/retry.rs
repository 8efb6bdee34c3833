use std::fmt::Display;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::error::RetryPolicy;

/// Retry an operation according to a fixed-delay policy.
///
/// The operation receives the 1-based attempt number. The last error is returned
/// once the policy runs out of attempts.
pub async fn with_retry<T, E, F>(operation: F, policy: RetryPolicy, log_context: &str) -> Result<T, E>
where
    F: Fn(usize) -> BoxFuture<'static, Result<T, E>> + Send + Sync,
    E: Display + Send,
    T: Send,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded after {} attempts", log_context, attempt);
                }
                return Ok(value);
            }
            Err(e) => match policy.delay_after(attempt) {
                None => {
                    error!("{} failed after {} attempts: {}", log_context, attempt, e);
                    return Err(e);
                }
                Some(delay) => {
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        log_context, attempt, policy.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_succeeds_on_second_attempt() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(
            move |attempt| {
                let counter = counter_clone.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(format!("Failed attempt {}", attempt))
                    } else {
                        Ok(attempt)
                    }
                })
            },
            RetryPolicy::fixed_delay(2, Duration::from_millis(1)),
            "test operation",
        )
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), String> = with_retry(
            move |attempt| {
                let counter = counter_clone.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(format!("Failed attempt {}", attempt))
                })
            },
            RetryPolicy::fixed_delay(2, Duration::from_millis(1)),
            "failing operation",
        )
        .await;

        assert_eq!(result.unwrap_err(), "Failed attempt 2");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retry_policy_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), String> = with_retry(
            move |_| {
                let counter = counter_clone.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("nope".to_string())
                })
            },
            RetryPolicy::no_retry(),
            "single shot",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
