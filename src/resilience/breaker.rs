//! Circuit breaker state machine.
//!
//! ```text
//!            failure_threshold consecutive failures
//!   CLOSED ───────────────────────────────────────────▶ OPEN
//!     ▲                                                  │
//!     │ success_threshold trial successes                │ call after recovery_timeout
//!     │                                                  ▼
//!     └──────────────────────────────────────────── HALF_OPEN
//!                   trial failure: back to OPEN, timer reset
//! ```

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are short-circuited.
    Open,
    /// A limited number of trial calls probe the dependency.
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used for the state gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    state_changes: u64,
}

/// Failure-isolation wrapper around calls to one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    metrics: Option<Arc<MetricsCollector>>,
}

/// Admission ticket for one call. Releases a half-open trial slot if the
/// call is dropped before reporting an outcome.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            let mut inner = self.breaker.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

impl CircuitBreaker {
    /// Create a breaker for `dependency`.
    pub fn new(dependency: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                opened_at: None,
                last_failure: None,
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
                rejected_calls: 0,
                state_changes: 0,
            }),
            metrics: None,
        }
    }

    /// Report state changes and rejections to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Current state. An open circuit stays open until a call arrives after
    /// the recovery timeout.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call issued now would be let through.
    pub fn is_call_permitted(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.recovery_timeout),
            CircuitState::HalfOpen => inner.half_open_in_flight < self.config.half_open_max_calls,
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.state_changes += 1;

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
                warn!(
                    dependency = %self.dependency,
                    failures = inner.consecutive_failures,
                    from = %from,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
                info!(dependency = %self.dependency, "Circuit breaker half-open, probing");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
                inner.opened_at = None;
                info!(dependency = %self.dependency, "Circuit breaker closed");
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_gauge(
                "circuit_breaker_state",
                &[("dependency", &self.dependency)],
                to.as_gauge(),
            );
        }
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed < self.config.recovery_timeout {
                    return Err(self.reject(&mut inner));
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                true
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    return Err(self.reject(&mut inner));
                }
                true
            }
        };

        if trial {
            inner.half_open_in_flight += 1;
        }
        Ok(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn reject(&self, inner: &mut Inner) -> Error {
        inner.rejected_calls += 1;
        debug!(dependency = %self.dependency, state = %inner.state, "Call short-circuited");
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(
                "circuit_breaker_rejections_total",
                &[("dependency", &self.dependency)],
                1.0,
            );
        }
        Error::CircuitOpen {
            dependency: self.dependency.clone(),
            failures: inner.consecutive_failures,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.successful_calls += 1;

        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen if trial => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // A late success from before the circuit opened changes nothing.
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.failed_calls += 1;
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if trial => {
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Run `f` through the breaker.
    ///
    /// Returns [`Error::CircuitOpen`] without calling `f` when the circuit is
    /// open. Every outcome of `f` is counted before it is returned.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    /// Like [`call`](Self::call), but a rejected or failed call is answered
    /// by `fallback`, which receives the error.
    pub async fn call_with_fallback<T, F, Fut, FB, FbFut>(&self, f: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(Error) -> FbFut,
        FbFut: Future<Output = Result<T>>,
    {
        match self.call(f).await {
            Ok(value) => Ok(value),
            Err(e) => fallback(e).await,
        }
    }

    /// Force the breaker back to a fresh closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.consecutive_failures = 0;
        inner.last_failure = None;
    }

    /// Snapshot of counters and state.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            dependency: self.dependency.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            state_changes: inner.state_changes,
            since_last_failure: inner.last_failure.map(|at| at.elapsed()),
        }
    }
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub state_changes: u64,
    pub since_last_failure: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "enricher",
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_recovery_timeout(recovery),
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async { Err(Error::from(StageError::failed("enricher", "down"))) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32> {
        b.call(|| async { Ok(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exactly_threshold_failures() {
        let b = breaker(3, Duration::from_secs(10));

        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);

        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        // Short-circuited without calling the function.
        let mut called = false;
        let err = b
            .call(|| {
                called = true;
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(!called);
        assert!(matches!(err, Error::CircuitOpen { failures: 3, .. }));
        assert_eq!(b.stats().rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let b = breaker(2, Duration::from_secs(10));
        fail(&b).await.unwrap_err();
        succeed(&b).await.unwrap();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let b = breaker(1, Duration::from_secs(10));
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(b.is_call_permitted());
        // Still reported open until a call arrives.
        assert_eq!(b.state(), CircuitState::Open);

        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().state_changes, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_timer() {
        let b = breaker(1, Duration::from_secs(10));
        fail(&b).await.unwrap_err();

        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        // The timer restarted at the trial failure.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(succeed(&b).await, Err(Error::CircuitOpen { .. })));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trial_calls() {
        let b = CircuitBreaker::new(
            "slow",
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_secs(1))
                .with_half_open_max_calls(1),
        );
        fail(&b).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(1)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = b.call(|| async move {
            let _ = release_rx.await;
            Ok(1)
        });
        let second = async {
            tokio::task::yield_now().await;
            let rejected = succeed(&b).await;
            let _ = release_tx.send(());
            rejected
        };

        let (first, second) = tokio::join!(trial, second);
        assert_eq!(first.unwrap(), 1);
        assert!(matches!(second, Err(Error::CircuitOpen { .. })));
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_answers_rejections_and_failures() {
        let b = breaker(1, Duration::from_secs(10));

        let value = b
            .call_with_fallback(
                || async { Err::<u32, _>(Error::Internal("boom".into())) },
                |_| async { Ok(0) },
            )
            .await
            .unwrap();
        assert_eq!(value, 0);
        assert_eq!(b.state(), CircuitState::Open);

        let value = b
            .call_with_fallback(|| async { Ok(1) }, |e| async move {
                assert!(matches!(e, Error::CircuitOpen { .. }));
                Ok(2)
            })
            .await
            .unwrap();
        assert_eq!(value, 2);

        let stats = b.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let b = breaker(1, Duration::from_secs(60));
        fail(&b).await.unwrap_err();
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(succeed(&b).await.is_ok());
    }
}
