//! Circuit Breaker
//!
//! Stops calling a repeatedly failing operation for a cooldown period.
//! After the cooldown a single trial call is let through (half-open); its
//! outcome closes or re-opens the breaker.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial call
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum BreakerState {
    Closed { failures: u32 },
    Open { until: Instant },
    /// Trial call in flight
    HalfOpen,
}

/// Consecutive-failure circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    /// Whether a call may proceed now
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Whether a call may proceed at `now`
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and
    /// admits exactly one caller.
    pub fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open { until } => {
                if now >= until {
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        *self.state.lock() = BreakerState::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut state = self.state.lock();
        let next = match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    tracing::warn!(
                        failures,
                        reset_secs = self.config.reset_timeout.as_secs(),
                        "Circuit breaker opened"
                    );
                    BreakerState::Open {
                        until: now + self.config.reset_timeout,
                    }
                } else {
                    BreakerState::Closed { failures }
                }
            }
            BreakerState::HalfOpen => {
                tracing::warn!("Circuit breaker trial call failed, reopening");
                BreakerState::Open {
                    until: now + self.config.reset_timeout,
                }
            }
            BreakerState::Open { until } => BreakerState::Open { until },
        };
        *state = next;
    }

    pub fn status(&self) -> BreakerStatus {
        match *self.state.lock() {
            BreakerState::Closed { .. } => BreakerStatus::Closed,
            BreakerState::Open { .. } => BreakerStatus::Open,
            BreakerState::HalfOpen => BreakerStatus::HalfOpen,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::default();
        let now = Instant::now();

        breaker.record_failure_at(now);
        breaker.record_failure_at(now);
        assert_eq!(breaker.status(), BreakerStatus::Closed);
        assert!(breaker.allow_at(now));

        breaker.record_failure_at(now);
        assert_eq!(breaker.status(), BreakerStatus::Open);
        assert!(!breaker.allow_at(now + Duration::from_secs(59)));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::default();
        let now = Instant::now();

        breaker.record_failure_at(now);
        breaker.record_failure_at(now);
        breaker.record_success();
        breaker.record_failure_at(now);
        assert_eq!(breaker.status(), BreakerStatus::Closed);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(10),
        });
        let now = Instant::now();
        breaker.record_failure_at(now);

        let later = now + Duration::from_secs(10);
        assert!(breaker.allow_at(later));
        assert_eq!(breaker.status(), BreakerStatus::HalfOpen);
        assert!(!breaker.allow_at(later));

        breaker.record_failure_at(later);
        assert_eq!(breaker.status(), BreakerStatus::Open);
        assert!(!breaker.allow_at(later + Duration::from_secs(5)));

        assert!(breaker.allow_at(later + Duration::from_secs(10)));
        breaker.record_success();
        assert_eq!(breaker.status(), BreakerStatus::Closed);
    }
}
