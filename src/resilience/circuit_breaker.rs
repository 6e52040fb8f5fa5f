//! Circuit breaker and the named-breaker registry
//!
//! `CLOSED` passes calls through and counts failures; once the count reaches
//! `failure_threshold` the breaker is `OPEN` and rejects calls without running
//! them. After `recovery_timeout_ms` since the last failure, one probe call is
//! let through (`HALF_OPEN`): success closes the breaker, failure re-opens it.

use crate::error::CircuitOpenError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is allowed, in milliseconds
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout_ms: recovery_timeout.as_millis() as u64,
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// A named circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state (an elapsed recovery timeout is reported as `HALF_OPEN`)
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        if inner.state == CircuitState::Open && self.recovery_elapsed(&inner) {
            CircuitState::HalfOpen
        } else {
            inner.state
        }
    }

    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state(),
            failures: self.failures(),
        }
    }

    /// Force the breaker back to `CLOSED`
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
        inner.probe_in_flight = false;
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Run `operation` under the breaker
    ///
    /// Returns `CircuitOpenError` (converted into `E`) without calling the
    /// operation when the breaker is open.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        let mut permit = self.acquire()?;
        let result = operation().await;
        permit.settled = true;
        match &result {
            Ok(_) => self.on_success(permit.probe),
            Err(_) => self.on_failure(permit.probe),
        }
        result
    }

    fn acquire(&self) -> std::result::Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.lock();
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open if self.recovery_elapsed(&inner) => {
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                tracing::info!(breaker = %self.name, "Circuit breaker half-open, allowing probe");
                true
            }
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                true
            }
            _ => {
                tracing::debug!(breaker = %self.name, "Circuit breaker rejected call");
                return Err(CircuitOpenError {
                    name: self.name.clone(),
                });
            }
        };
        Ok(Permit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// Only the half-open probe may close the breaker; a call admitted
    /// before the breaker opened does not.
    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen if probe => {
                tracing::info!(breaker = %self.name, "Circuit breaker closed");
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.last_failure = None;
            }
            _ => {
                tracing::debug!(breaker = %self.name, state = %inner.state, "Ignoring late success");
            }
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        if probe {
            inner.probe_in_flight = false;
        }

        let reopen = inner.state == CircuitState::HalfOpen;
        if reopen || inner.failures >= self.config.failure_threshold {
            if inner.state != CircuitState::Open {
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker opened"
                );
            }
            inner.state = CircuitState::Open;
        }
    }

    fn recovery_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .last_failure
            .map(|at| at.elapsed() >= self.config.recovery_timeout())
            .unwrap_or(true)
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the half-open probe slot if the call is dropped mid-flight
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

/// Process-wide set of breakers keyed by name
///
/// Call sites sharing a dependency use the same name (by convention
/// `<caller>.<method>.<label>`) and therefore share failure accounting.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `name`, created with the registry defaults on first use
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.defaults)
    }

    /// Breaker for `name`; `config` only applies if it does not exist yet
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Snapshot of every registered breaker
    pub fn states(&self) -> HashMap<String, CircuitSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Reset one breaker; `false` if no breaker has that name
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MessagingError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "llm.complete.default",
            CircuitBreakerConfig::new(threshold, Duration::from_millis(recovery_ms)),
        )
    }

    async fn fail(b: &CircuitBreaker) -> std::result::Result<(), MessagingError> {
        b.execute(|| async { Err(MessagingError::upstream(Some(502), "bad gateway")) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> std::result::Result<(), MessagingError> {
        b.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let b = breaker(3, 10_000);
        for _ in 0..2 {
            assert!(fail(&b).await.is_err());
            assert_eq!(b.state(), CircuitState::Closed);
        }
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.failures(), 3);
    }

    #[tokio::test]
    async fn test_open_rejects_without_calling() {
        let b = breaker(1, 10_000);
        let _ = fail(&b).await;

        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), MessagingError> = b
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(MessagingError::CircuitOpen(ref e)) if e.name == "llm.complete.default"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(result.unwrap_err().to_string().contains("is OPEN"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let b = breaker(3, 1_000);
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        assert!(matches!(succeed(&b).await, Err(MessagingError::CircuitOpen(_))));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let b = breaker(2, 500);
        let _ = fail(&b).await;
        let _ = fail(&b).await;

        tokio::time::advance(Duration::from_millis(600)).await;
        let result = fail(&b).await;
        assert!(matches!(result, Err(MessagingError::Upstream { .. })));
        assert_eq!(b.state(), CircuitState::Open);

        // Recovery window restarts from the probe failure
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(matches!(succeed(&b).await, Err(MessagingError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_single_probe() {
        let b = Arc::new(breaker(1, 100));
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_millis(100)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(|| async {
                    let _ = rx.await;
                    Ok::<_, MessagingError>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        assert!(matches!(succeed(&b).await, Err(MessagingError::CircuitOpen(_))));

        tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_open_breaker() {
        let b = Arc::new(breaker(1, 1_000));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(|| async {
                    let _ = rx.await;
                    Ok::<_, MessagingError>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        // Admitted while closed; a later failure trips the breaker
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        tx.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.failures(), 1);
        assert!(matches!(succeed(&b).await, Err(MessagingError::CircuitOpen(_))));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let b = breaker(3, 10_000);
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.failures(), 0);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_registry_shares_breakers_by_name() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::new(2, Duration::from_secs(30)));
        let a = registry.get_or_create("matching.score.llm");
        let b = registry.get_or_create("matching.score.llm");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        let _ = fail(&a).await;
        let _ = fail(&b).await;

        let states = registry.states();
        assert_eq!(states["matching.score.llm"].state, CircuitState::Open);
        assert_eq!(states["matching.score.llm"].failures, 2);

        assert!(registry.reset("matching.score.llm"));
        assert_eq!(a.state(), CircuitState::Closed);
        assert!(!registry.reset("unknown"));
    }

    #[test]
    fn test_state_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&CircuitState::HalfOpen).unwrap(), "\"HALF_OPEN\"");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
    }
}
