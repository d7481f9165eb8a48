//! Circuit breaker for webhook delivery.
//!
//! `Closed → Open` after `failure_threshold` consecutive failed deliveries.
//! While open, non-critical traffic is skipped for `backoff`. Once the
//! window has passed the breaker is `HalfOpen` and the next delivery
//! decides: success closes it, failure re-opens it for another window.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    backoff: Duration,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, backoff: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            backoff,
            consecutive_failures: 0,
            backoff_until: None,
        }
    }

    pub fn state(&self, now: Instant) -> BreakerState {
        match self.backoff_until {
            Some(until) if now < until => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
            None => BreakerState::Closed,
        }
    }

    /// Whether non-critical traffic may be delivered.
    pub fn allows(&self, now: Instant) -> bool {
        self.state(now) != BreakerState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a delivered request. Returns the failure streak it ended.
    pub fn record_success(&mut self) -> u32 {
        let streak = self.consecutive_failures;
        self.consecutive_failures = 0;
        self.backoff_until = None;
        streak
    }

    /// Record a failed delivery. Returns `true` when this opened the breaker.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures >= self.failure_threshold {
            self.backoff_until = Some(now + self.backoff);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKOFF: Duration = Duration::from_secs(30);

    #[test]
    fn test_opens_after_threshold() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(3, BACKOFF);

        assert!(!breaker.record_failure(now));
        assert!(!breaker.record_failure(now));
        assert_eq!(breaker.state(now), BreakerState::Closed);

        assert!(breaker.record_failure(now));
        assert_eq!(breaker.state(now), BreakerState::Open);
        assert!(!breaker.allows(now));
    }

    #[test]
    fn test_half_open_after_backoff() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(3, BACKOFF);
        for _ in 0..3 {
            breaker.record_failure(now);
        }

        let later = now + BACKOFF;
        assert_eq!(breaker.state(later), BreakerState::HalfOpen);
        assert!(breaker.allows(later));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(3, BACKOFF);
        for _ in 0..3 {
            breaker.record_failure(now);
        }

        let later = now + BACKOFF + Duration::from_secs(1);
        assert!(breaker.record_failure(later));
        assert_eq!(breaker.state(later), BreakerState::Open);
        assert_eq!(breaker.consecutive_failures(), 4);
    }

    #[test]
    fn test_success_closes_and_reports_streak() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(3, BACKOFF);
        for _ in 0..3 {
            breaker.record_failure(now);
        }

        assert_eq!(breaker.record_success(), 3);
        assert_eq!(breaker.state(now), BreakerState::Closed);
        assert_eq!(breaker.record_success(), 0);
    }
}
