//! Consecutive-failure circuit breaker.
//!
//! Owned by a single worker; the policy is half-open-by-time: once the
//! failure threshold is reached the worker stops fetching, sleeps its
//! cooldown, then resets the breaker and resumes. The next failure can
//! reopen it immediately.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::{info, warn};

pub struct CircuitBreaker {
    /// Consecutive failures before the breaker opens
    threshold: u32,

    /// Current consecutive-failure count
    consecutive_failures: AtomicU32,

    /// Total times the breaker has opened
    opened_total: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive_failures: AtomicU32::new(0),
            opened_total: AtomicU64::new(0),
        }
    }

    /// Record a successful delivery. A single success closes the breaker.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Record a failed delivery attempt.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures == self.threshold {
            warn!(failures, "circuit breaker opened");
            self.opened_total.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Whether consumption should pause.
    pub fn is_open(&self) -> bool {
        self.consecutive_failures.load(Ordering::SeqCst) >= self.threshold
    }

    /// Close the breaker after the cooldown.
    pub fn reset(&self) {
        info!("circuit breaker reset");
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn opened_total(&self) -> u64 {
        self.opened_total.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_exactly_at_threshold() {
        let breaker = CircuitBreaker::new(5);

        for _ in 0..4 {
            breaker.record_failure();
            assert!(!breaker.is_open());
        }
        breaker.record_failure();
        assert!(breaker.is_open());
        assert_eq!(breaker.opened_total(), 1);
    }

    #[test]
    fn test_single_success_closes() {
        let breaker = CircuitBreaker::new(5);
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());

        breaker.record_success();
        assert!(!breaker.is_open());
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_success_resets_partial_streak() {
        let breaker = CircuitBreaker::new(3);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();

        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn test_reset_closes_and_can_reopen() {
        let breaker = CircuitBreaker::new(2);
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());

        breaker.reset();
        assert!(!breaker.is_open());

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());
        assert_eq!(breaker.opened_total(), 2);
    }
}
