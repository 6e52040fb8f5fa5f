//! Retry with exponential backoff
//!
//! Wraps any async operation. Delays grow geometrically from `base_delay_ms`
//! and are capped at `max_delay_ms`; an optional random jitter spreads out
//! callers that failed together.
//!
//! ## Retryable errors (default predicate)
//!
//! - I/O errors: connection refused / reset / aborted, timed out
//! - `MessagingError::Connection`, `MessagingError::Timeout`
//! - `MessagingError::Upstream` with status 408, 429, 502, 503, 504
//! - any error in the source chain whose message mentions
//!   "connection", "timeout" or "ENOTFOUND"
//!
//! An open circuit breaker is never retried.

use crate::error::{CircuitOpenError, MessagingError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// HTTP status codes the default predicate treats as transient
pub const RETRYABLE_STATUS_CODES: [u16; 5] = [408, 429, 502, 503, 504];

/// Decides whether a failure is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// Retry behaviour for `with_exponential_backoff`
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryOptions {
    /// Total attempts, including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Growth factor applied per retry
    pub multiplier: f64,
    /// Cap on the computed delay, in milliseconds
    pub max_delay_ms: u64,
    /// Upper bound of the random delay added to each wait, in milliseconds
    pub jitter_ms: u64,
    /// Custom retry predicate; `is_retryable_error` when unset
    #[serde(skip)]
    pub retry_if: Option<RetryPredicate>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_ms: 100,
            retry_if: None,
        }
    }
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("multiplier", &self.multiplier)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("jitter_ms", &self.jitter_ms)
            .field("retry_if", &self.retry_if.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl RetryOptions {
    /// Options that never retry
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Replace the retry predicate
    pub fn retry_if(
        mut self,
        predicate: impl Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Delay before attempt `attempt` (2 = first retry), without jitter
    ///
    /// `min(base_delay * multiplier^(attempt - 2), max_delay)`, so the
    /// first retry waits exactly `base_delay`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before attempt `attempt`, jitter included
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        self.backoff_for_attempt(attempt) + Duration::from_millis(jitter)
    }

    pub(crate) fn should_retry(&self, error: &(dyn StdError + 'static)) -> bool {
        match &self.retry_if {
            Some(predicate) => predicate(error),
            None => is_retryable_error(error),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is reached
///
/// The closure receives the 1-based attempt number. The last error is
/// returned as-is so callers can still match on its type.
pub async fn with_exponential_backoff<T, E, F, Fut>(
    options: &RetryOptions,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: StdError + 'static,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if attempt >= max_attempts || !options.should_retry(&error) {
                    return Err(error);
                }

                let delay = options.delay_for_attempt(attempt + 1);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Default retry predicate: network failures and transient upstream statuses
pub fn is_retryable_error(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);

    while let Some(err) = current {
        if err.downcast_ref::<CircuitOpenError>().is_some() {
            return false;
        }

        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
            ) {
                return true;
            }
        }

        if let Some(messaging) = err.downcast_ref::<MessagingError>() {
            match messaging {
                MessagingError::CircuitOpen(_) => return false,
                MessagingError::Connection(_) | MessagingError::Timeout(_) => return true,
                MessagingError::Upstream {
                    status: Some(status),
                    ..
                } if RETRYABLE_STATUS_CODES.contains(status) => return true,
                _ => {}
            }
        }

        let message = err.to_string().to_lowercase();
        if message.contains("connection") || message.contains("timeout") || message.contains("enotfound") {
            return true;
        }

        current = err.source();
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn no_jitter() -> RetryOptions {
        RetryOptions {
            jitter_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_retry_options_default() {
        let opts = RetryOptions::default();
        assert_eq!(opts.max_attempts, 3);
        assert_eq!(opts.base_delay_ms, 1000);
        assert_eq!(opts.max_delay_ms, 30_000);
        assert!(opts.retry_if.is_none());
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let opts = no_jitter();
        let delays: Vec<u64> = (2..=8)
            .map(|n| opts.backoff_for_attempt(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let opts = RetryOptions {
            jitter_ms: 50,
            ..Default::default()
        };
        for _ in 0..100 {
            let delay = opts.delay_for_attempt(3).as_millis() as u64;
            assert!((2000..=2050).contains(&delay));
        }
    }

    #[test]
    fn test_default_predicate() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(is_retryable_error(&refused));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!is_retryable_error(&denied));

        assert!(is_retryable_error(&MessagingError::upstream(Some(503), "unavailable")));
        assert!(is_retryable_error(&MessagingError::upstream(Some(429), "slow down")));
        assert!(!is_retryable_error(&MessagingError::upstream(Some(400), "bad request")));

        assert!(is_retryable_error(&MessagingError::Timeout("publish".to_string())));
        assert!(is_retryable_error(&MessagingError::Config(
            "getaddrinfo ENOTFOUND nats".to_string()
        )));
        assert!(!is_retryable_error(&MessagingError::Config("bad value".to_string())));

        let open = CircuitOpenError {
            name: "db.connection".to_string(),
        };
        assert!(!is_retryable_error(&open));
        assert!(!is_retryable_error(&MessagingError::from(open)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success_with_backoff() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result = with_exponential_backoff(&no_jitter(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(MessagingError::Connection("refused".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_returned_unchanged() {
        let calls = AtomicU32::new(0);

        let result: std::result::Result<(), _> = with_exponential_backoff(&no_jitter(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MessagingError::Config("bad".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(MessagingError::Config(ref m)) if m == "bad"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_error_returned_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: std::result::Result<(), _> = with_exponential_backoff(&no_jitter(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(MessagingError::upstream(Some(503), format!("attempt {}", attempt))) }
        })
        .await;

        match result {
            Err(MessagingError::Upstream { status, message }) => {
                assert_eq!(status, Some(503));
                assert_eq!(message, "attempt 3");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        let calls = AtomicU32::new(0);
        let opts = no_jitter().retry_if(|e| e.to_string().contains("flaky"));

        let result: std::result::Result<(), _> = with_exponential_backoff(&opts, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MessagingError::Stream("flaky".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disabled_runs_once() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> =
            with_exponential_backoff(&RetryOptions::disabled(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(MessagingError::Connection("down".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
