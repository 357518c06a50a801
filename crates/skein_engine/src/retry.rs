//! Retry logic with exponential backoff, per-attempt timeout and cooperative
//! cancellation for outbound calls.
//!
//! Retries on transient conditions (408, 429, 5xx, network errors, attempt
//! timeouts). Does NOT retry on other client errors (400, 401, 403, 404).

use skein_core::error::Error;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub base_wait: Duration,
    /// Maximum delay between retries.
    pub max_wait: Duration,
    /// Hard wall-clock timeout per attempt, independent of backoff.
    pub attempt_timeout: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryOptions {
    pub fn from_settings(
        settings: &skein_core::config::RetrySettings,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_wait: Duration::from_millis(settings.base_wait_ms),
            max_wait: Duration::from_millis(settings.max_wait_ms),
            attempt_timeout,
        }
    }
}

/// How a single attempt failed.
#[derive(Debug, Clone)]
pub enum AttemptError {
    /// Worth re-attempting: rate limit, server error, network failure.
    Retryable {
        message: String,
        status: Option<u16>,
    },
    /// Re-attempting won't help: client error, malformed response.
    Fatal {
        message: String,
        status: Option<u16>,
    },
}

impl AttemptError {
    pub fn retryable(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Retryable {
            message: message.into(),
            status,
        }
    }

    pub fn fatal(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Fatal {
            message: message.into(),
            status,
        }
    }
}

/// Determine if a status code is retryable: request timeout, rate limit, and
/// the whole 5xx range (which covers the Cloudflare 52x family).
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..=599).contains(&status)
}

/// Successful call plus how many retries it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub retries: u32,
}

/// Execute an async operation with retry logic.
///
/// The `operation` closure is called repeatedly until it succeeds, returns a
/// fatal error, the retry budget is exhausted, or `cancel` fires. Each
/// attempt runs under `attempt_timeout`; a timed-out attempt counts as
/// retryable. Cancellation — in-flight or during backoff — yields
/// [`Error::Cancelled`], never a generic failure.
pub async fn call_with_retry<T, F, Fut>(
    options: &RetryOptions,
    phase: &'static str,
    cancel: &CancellationToken,
    operation: F,
) -> Result<RetryOutcome<T>, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let attempts = options.max_retries + 1;
    let mut delay = options.base_wait;
    let mut last_message = String::from("no attempt made");
    let mut last_status: Option<u16> = None;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled { phase });
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled { phase }),
            res = tokio::time::timeout(options.attempt_timeout, operation()) => res,
        };

        match outcome {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    tracing::info!("{} succeeded on attempt {}", phase, attempt);
                }
                return Ok(RetryOutcome {
                    value,
                    retries: attempt - 1,
                });
            }
            Ok(Err(AttemptError::Fatal { message, status })) => {
                return Err(Error::Transport {
                    phase,
                    message,
                    status,
                    retries: attempt - 1,
                });
            }
            Ok(Err(AttemptError::Retryable { message, status })) => {
                tracing::warn!(
                    "{} failed on attempt {}/{}: {}",
                    phase,
                    attempt,
                    attempts,
                    message
                );
                last_message = message;
                last_status = status;
            }
            Err(_elapsed) => {
                tracing::warn!(
                    "{} timed out after {:.0}s on attempt {}/{}",
                    phase,
                    options.attempt_timeout.as_secs_f64(),
                    attempt,
                    attempts
                );
                last_message = format!(
                    "attempt timed out after {}s",
                    options.attempt_timeout.as_secs()
                );
                last_status = None;
            }
        }

        if attempt < attempts {
            let sleep_time = delay + jitter();
            tracing::info!(
                "{} retrying in {:.1}s (attempt {}/{})",
                phase,
                sleep_time.as_secs_f64(),
                attempt + 1,
                attempts
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled { phase }),
                _ = tokio::time::sleep(sleep_time) => {}
            }

            delay = (delay * 2).min(options.max_wait);
        }
    }

    Err(Error::Transport {
        phase,
        message: format!("all {} attempts exhausted: {}", attempts, last_message),
        status: last_status,
        retries: options.max_retries,
    })
}

/// Simple jitter: random 0-500ms using timestamp as poor-man's random.
fn jitter() -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    Duration::from_millis((nanos % 500) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_options() -> RetryOptions {
        RetryOptions {
            max_retries: 3,
            base_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(5),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_two_retryable_failures() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let outcome = call_with_retry(&fast_options(), "chat request", &cancel, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(AttemptError::retryable("HTTP 503", Some(503)))
            } else {
                Ok(42u32)
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.retries, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_status_fails_without_retrying() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let err = call_with_retry(&fast_options(), "chat request", &cancel, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(AttemptError::fatal("HTTP 401", Some(401)))
        })
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        match err {
            Error::Transport {
                phase,
                status,
                retries,
                ..
            } => {
                assert_eq!(phase, "chat request");
                assert_eq!(status, Some(401));
                assert_eq!(retries, 0);
            }
            other => panic!("Expected Transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_reports_last_error() {
        let cancel = CancellationToken::new();

        let err = call_with_retry(&fast_options(), "chat request", &cancel, || async {
            Err::<u32, _>(AttemptError::retryable("HTTP 429", Some(429)))
        })
        .await
        .unwrap_err();

        match err {
            Error::Transport {
                status, retries, ..
            } => {
                assert_eq!(status, Some(429));
                assert_eq!(retries, 3);
            }
            other => panic!("Expected Transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_backoff_reports_cancelled_not_error() {
        let options = RetryOptions {
            max_retries: 3,
            base_wait: Duration::from_secs(60),
            max_wait: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(5),
        };
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        // Cancel while the transport sits in its first backoff sleep.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let err = call_with_retry(&options, "chat request", &cancel, || async {
            Err::<u32, _>(AttemptError::retryable("HTTP 503", Some(503)))
        })
        .await
        .unwrap_err();

        assert!(err.is_cancelled(), "expected Cancelled, got {:?}", err);
    }

    #[tokio::test]
    async fn test_cancel_before_first_attempt_makes_no_call() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = call_with_retry(&fast_options(), "chat request", &cancel, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok(1u32)
        })
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_retryable() {
        let attempts = std::sync::Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let options = RetryOptions {
            max_retries: 1,
            base_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(5),
            attempt_timeout: Duration::from_millis(50),
        };

        let counter = attempts.clone();
        let err = call_with_retry(&options, "tool execution", &cancel, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(1u32)
            }
        })
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        match err {
            Error::Transport { message, .. } => assert!(message.contains("timed out")),
            other => panic!("Expected Transport error, got {:?}", other),
        }
    }

    #[test]
    fn test_retryable_status_classification() {
        assert!(is_retryable_status(408));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(524)); // Cloudflare a-timeout-occurred
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(200));
    }
}
