/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Circuit breaker for external dependencies.
//!
//! States: `closed -> open -> half_open -> closed`. The breaker opens after
//! N consecutive failures and blocks calls for the recovery timeout; once
//! the timeout elapses a single probe is allowed through (half-open). A
//! successful probe closes the breaker, a failed one re-opens it.
//!
//! Two named breakers guard the orchestrator's hot paths: the container
//! runtime and the object-storage log backup. External collaborators with
//! their own dependencies (OAuth token endpoints, git remotes) construct
//! breakers with the same primitive.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// A named circuit breaker.
///
/// Thread-safe; clones share nothing — wrap in `Arc` to share.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a breaker that opens after `failure_threshold` consecutive
    /// failures and stays open for `recovery_timeout`.
    pub fn new(name: &'static str, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Breaker guarding the container runtime / cluster API.
    pub fn container_runtime() -> Self {
        Self::new("container-runtime", 5, Duration::from_secs(30))
    }

    /// Breaker guarding object storage (log backup).
    pub fn object_storage() -> Self {
        Self::new("object-storage", 3, Duration::from_secs(60))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state, advancing open -> half_open when the timeout elapsed.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.advance(&mut inner);
        inner.state
    }

    /// Checks whether a call may proceed.
    ///
    /// Returns `Err` with a human message while the breaker is open. In
    /// half-open state the first caller is admitted as the probe.
    pub fn check(&self) -> Result<(), String> {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.advance(&mut inner);
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => Err(format!(
                "{} circuit breaker is open; retrying after cooldown",
                self.name
            )),
        }
    }

    /// Records a successful call, closing the breaker.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.state != BreakerState::Closed {
            info!(breaker = self.name, "Circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Records a failed call; opens the breaker at the threshold, and
    /// re-opens immediately when a half-open probe fails.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.advance(&mut inner);
        inner.consecutive_failures += 1;
        let should_open = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.failure_threshold,
            BreakerState::Open => false,
        };
        if should_open {
            warn!(
                breaker = self.name,
                failures = inner.consecutive_failures,
                "Circuit breaker opened"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Runs an async operation through the breaker.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.check().map_err(CircuitBreakerError::Open)?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Forgets accumulated state (graceful shutdown).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn advance(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.recovery_timeout {
                    info!(breaker = self.name, "Circuit breaker half-open (probe)");
                    inner.state = BreakerState::HalfOpen;
                }
            }
        }
    }
}

/// Error from a breaker-guarded call.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker rejected the call without running it
    #[error("{0}")]
    Open(String),
    /// The operation ran and failed
    #[error(transparent)]
    Inner(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", 3, Duration::from_millis(50))
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = failing_breaker();
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.check().is_err());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = failing_breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_closes_on_success() {
        let breaker = failing_breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.check().is_ok());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_reopens_on_failure() {
        let breaker = failing_breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.check().is_err());
    }

    #[tokio::test]
    async fn test_call_wraps_operation() {
        let breaker = failing_breaker();

        let ok: Result<i32, CircuitBreakerError<&str>> = breaker.call(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        for _ in 0..3 {
            let _: Result<i32, _> = breaker.call(|| async { Err("down") }).await;
        }
        let blocked: Result<i32, CircuitBreakerError<&str>> =
            breaker.call(|| async { Ok(7) }).await;
        assert!(matches!(blocked, Err(CircuitBreakerError::Open(_))));
    }
}
