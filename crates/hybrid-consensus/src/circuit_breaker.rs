// VALIDATION CIRCUIT BREAKER
// Fails block validation fast after repeated operational faults.
//
// SAFETY INVARIANTS:
// 1. Within reset_timeout of the last failure, the circuit is open iff failures >= threshold
// 2. A clean validation run resets the consecutive-failure count
// 3. Once reset_timeout has passed since the last failure the count resets
// 4. The failure count saturates instead of wrapping

use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerState {
    pub failures: u32,
    /// Milliseconds since the last failure, if any.
    pub since_last_failure_ms: Option<u64>,
    pub threshold: u32,
    pub reset_timeout_ms: u64,
}

#[derive(Debug)]
struct Inner {
    failures: u32,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        CircuitBreaker {
            inner: Mutex::new(Inner {
                failures: 0,
                last_failure: None,
            }),
            threshold,
            reset_timeout,
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        if inner.failures == self.threshold {
            warn!(
                "Validation circuit opened after {} consecutive failures",
                inner.failures
            );
        }
    }

    /// A clean validation run clears the consecutive-failure count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.failures > 0 {
            inner.failures = 0;
        }
    }

    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock();
        if let Some(last) = inner.last_failure {
            if last.elapsed() > self.reset_timeout {
                if inner.failures >= self.threshold {
                    info!("Validation circuit closed after cool-down");
                }
                inner.failures = 0;
                return false;
            }
        }
        inner.failures >= self.threshold
    }

    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    pub fn state(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            failures: inner.failures,
            since_last_failure_ms: inner.last_failure.map(|t| t.elapsed().as_millis() as u64),
            threshold: self.threshold,
            reset_timeout_ms: self.reset_timeout.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_closed_below_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        assert_eq!(breaker.failures(), 2);
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
    }

    #[test]
    fn test_resets_after_timeout() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(20));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());

        sleep(Duration::from_millis(40));
        assert!(!breaker.is_open());
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn test_success_clears_failures() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_state_snapshot() {
        let breaker = CircuitBreaker::new(5, Duration::from_millis(1500));
        assert!(breaker.state().since_last_failure_ms.is_none());
        breaker.record_failure();
        let state = breaker.state();
        assert_eq!(state.failures, 1);
        assert_eq!(state.threshold, 5);
        assert_eq!(state.reset_timeout_ms, 1500);
        assert!(state.since_last_failure_ms.is_some());
    }
}
