//! Circuit breaker guarding calls to the distributed store.
//!
//! While the store is healthy every call goes through, raced against a fixed
//! timeout. After `failure_threshold` failures the circuit opens and calls go
//! straight to the fallback until `reset_timeout` has passed since the last
//! failure; the next call is then a half-open trial. Store failures are never
//! returned to the caller.
//!
//! State is process-local. Separate instances trip independently.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls reach the store
    Closed,
    /// Calls go straight to the fallback
    Open,
    /// Trial calls reach the store after the cooldown
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown after the last failure before a trial call, in seconds
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,

    /// Deadline for a single store call, in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_secs() -> u64 {
    60
}

fn default_call_timeout_ms() -> u64 {
    5000
}

impl BreakerConfig {
    /// Cooldown as a duration.
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    /// Per-call deadline as a duration.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_ms: u64,
}

/// A failure-counting circuit breaker with a per-call timeout.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_ms: 0,
            }),
            clock,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failures recorded since the circuit last closed.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Run `primary` unless the circuit is open; answer from `fallback` on
    /// open circuit, error or timeout.
    ///
    /// `primary` is only called when the circuit lets the call through.
    pub async fn execute<T, E, P, Fut, F>(&self, primary: P, fallback: F) -> T
    where
        P: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        F: FnOnce() -> T,
        E: fmt::Display,
    {
        if !self.admit_call() {
            debug!("Circuit breaker open, using fallback");
            return fallback();
        }

        let timeout = self.config.call_timeout();
        match tokio::time::timeout(timeout, primary()).await {
            Ok(Ok(value)) => {
                self.on_success();
                value
            }
            Ok(Err(e)) => {
                self.on_failure(&e);
                fallback()
            }
            Err(_) => {
                self.on_failure(&format_args!("timed out after {:?}", timeout));
                fallback()
            }
        }
    }

    /// Decide whether a call may reach the store, moving open to half-open
    /// once the cooldown has passed.
    fn admit_call(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return true;
        }

        let elapsed = self.clock.now_millis().saturating_sub(inner.last_failure_ms);
        let cooldown = u64::try_from(self.config.reset_timeout().as_millis()).unwrap_or(u64::MAX);
        if elapsed >= cooldown {
            inner.state = CircuitState::HalfOpen;
            info!(elapsed_ms = elapsed, "Circuit breaker half-open, trying store");
            true
        } else {
            false
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(
                previous_failures = inner.failure_count,
                "Circuit breaker closed, store recovered"
            );
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
        }
    }

    fn on_failure(&self, cause: &dyn fmt::Display) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_ms = self.clock.now_millis();

        if inner.failure_count >= self.config.failure_threshold
            && inner.state != CircuitState::Open
        {
            inner.state = CircuitState::Open;
            error!(
                failures = inner.failure_count,
                cooldown_secs = self.config.reset_timeout_secs,
                error = %cause,
                "Circuit breaker tripped, store calls suspended"
            );
        } else {
            warn!(
                failures = inner.failure_count,
                state = %inner.state,
                error = %cause,
                "Rate limit store call failed, using fallback"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let config = BreakerConfig {
            failure_threshold: threshold,
            reset_timeout_secs: 60,
            call_timeout_ms: 50,
        };
        (CircuitBreaker::with_clock(config, clock.clone()), clock)
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicUsize) -> &'static str {
        breaker
            .execute(
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<&str, _>("connection refused")
                },
                || "fallback",
            )
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicUsize) -> &'static str {
        breaker
            .execute(
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>("primary")
                },
                || "fallback",
            )
            .await
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let (breaker, _) = breaker(3);
        let calls = AtomicUsize::new(0);

        assert_eq!(succeed(&breaker, &calls).await, "primary");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_uses_fallback_and_counts() {
        let (breaker, _) = breaker(3);
        let calls = AtomicUsize::new(0);

        assert_eq!(fail(&breaker, &calls).await, "fallback");
        assert_eq!(breaker.failure_count(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_skips_primary() {
        let (breaker, _) = breaker(3);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            fail(&breaker, &calls).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Fail fast: primary is not invoked
        assert_eq!(succeed(&breaker, &calls).await, "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_half_open_trial_closes_on_success() {
        let (breaker, clock) = breaker(2);
        let calls = AtomicUsize::new(0);

        fail(&breaker, &calls).await;
        fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(59_999);
        assert_eq!(succeed(&breaker, &calls).await, "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        clock.advance(1);
        assert_eq!(succeed(&breaker, &calls).await, "primary");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let (breaker, clock) = breaker(2);
        let calls = AtomicUsize::new(0);

        fail(&breaker, &calls).await;
        fail(&breaker, &calls).await;
        clock.advance(60_000);

        assert_eq!(fail(&breaker, &calls).await, "fallback");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 3);

        // Cooldown restarts from the failed trial
        clock.advance(30_000);
        assert_eq!(succeed(&breaker, &calls).await, "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let (breaker, _) = breaker(1);

        let result = breaker
            .execute(
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, String>("too late")
                },
                || "fallback",
            )
            .await;

        assert_eq!(result, "fallback");
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_intermittent_failures_still_trip() {
        let (breaker, _) = breaker(3);
        let calls = AtomicUsize::new(0);

        fail(&breaker, &calls).await;
        succeed(&breaker, &calls).await;
        fail(&breaker, &calls).await;
        succeed(&breaker, &calls).await;
        assert_eq!(breaker.failure_count(), 2);
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(succeed(&breaker, &calls).await, "fallback");
    }
}
