//! Resilience primitives for outbound calls (broker, LLM APIs, database)
//!
//! Independent of the messaging core: both wrap any async operation.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use retry::{is_retryable_error, with_exponential_backoff, RetryOptions, RetryPredicate};

use crate::error::CircuitOpenError;
use std::future::Future;

/// Retry an operation that runs behind a circuit breaker
///
/// Each attempt goes through `breaker`; a rejection from an open breaker is
/// not retried by the default predicate, so the call fails fast once the
/// breaker trips.
pub async fn call_with_resilience<T, E, F, Fut>(
    breaker: &CircuitBreaker,
    retry: &RetryOptions,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::error::Error + From<CircuitOpenError> + 'static,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match breaker.execute(|| operation(attempt)).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !retry.should_retry(&error) {
                    return Err(error);
                }

                let delay = retry.delay_for_attempt(attempt + 1);
                tracing::warn!(
                    breaker = %breaker.name(),
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Protected call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
