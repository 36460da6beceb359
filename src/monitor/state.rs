//! Channel State Machine
//!
//! Every state change of a physical channel goes through
//! [`ChannelHandle::apply`]. The function is pure apart from mutating the
//! handle; the monitor turns the returned [`Transition`] into timers and
//! provider calls.
//!
//! ```text
//! Connecting --Opened--> Open --Failed--> Degraded --RetryDue--> Connecting
//!      |                  |                                         |
//!      +--Failed----------+--Failed (attempts exhausted)--> Closed <-+
//! ```

use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle state of a physical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Connecting,
    Open,
    Degraded,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Degraded => "degraded",
            ChannelState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a channel failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TimedOut,
    ChannelError,
    /// Provider closed the channel without us asking
    Closed,
    /// Liveness channel stopped echoing heartbeats
    HeartbeatTimeout,
    /// Opening the channel failed before any status arrived
    OpenFailed,
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelInput {
    /// Provider confirmed the subscription
    Opened,
    Failed(FailureKind),
    /// Backoff timer fired
    RetryDue,
    /// Stall confirmed or reconnect explicitly requested
    ForceReconnect,
    /// Last subscriber left
    CloseRequested,
}

/// What the monitor must do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Channel is open; cancel pending retry and stall timers
    Confirmed,
    /// Schedule a reconnect after `backoff(attempt)`
    ScheduleRetry { attempt: u32 },
    /// Tear down the current instance and open a new one now
    Reopen,
    /// Attempts exhausted; tear down and report fatal connectivity
    GiveUp { attempts: u32 },
    /// Intentional close; tear down without retrying
    Release,
    Ignored,
}

/// One physical connection as seen by the monitor
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub name: String,
    pub state: ChannelState,
    pub subscriber_count: usize,
    pub last_event_at: Instant,
    pub retry_count: u32,
}

impl ChannelHandle {
    pub fn new(name: impl Into<String>, now: Instant) -> Self {
        Self {
            name: name.into(),
            state: ChannelState::Connecting,
            subscriber_count: 0,
            last_event_at: now,
            retry_count: 0,
        }
    }

    /// The single authoritative transition function
    pub fn apply(&mut self, input: ChannelInput, max_attempts: u32, now: Instant) -> Transition {
        use ChannelInput::*;
        use ChannelState::*;

        match (self.state, input) {
            (Closed, _) => Transition::Ignored,

            (_, CloseRequested) => {
                self.state = Closed;
                Transition::Release
            }

            (Connecting | Open | Degraded, Opened) => {
                self.state = Open;
                self.retry_count = 0;
                self.last_event_at = now;
                Transition::Confirmed
            }

            // A retry is already pending
            (Degraded, Failed(_)) => Transition::Ignored,

            (Connecting | Open, Failed(_)) => {
                self.retry_count += 1;
                if self.retry_count >= max_attempts {
                    self.state = Closed;
                    Transition::GiveUp {
                        attempts: self.retry_count,
                    }
                } else {
                    self.state = Degraded;
                    Transition::ScheduleRetry {
                        attempt: self.retry_count - 1,
                    }
                }
            }

            (Degraded, RetryDue) => {
                self.state = Connecting;
                Transition::Reopen
            }
            (Connecting | Open, RetryDue) => Transition::Ignored,

            (Connecting | Open | Degraded, ForceReconnect) => {
                self.state = Connecting;
                self.last_event_at = now;
                Transition::Reopen
            }
        }
    }

    /// Fresh start used by reconnect sweeps and re-subscription after give-up
    pub fn reset(&mut self, now: Instant) {
        self.state = ChannelState::Connecting;
        self.retry_count = 0;
        self.last_event_at = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_event_at)
    }
}

/// Exponential reconnect delay with symmetric jitter
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub factor: f64,
    /// Jitter as a fraction of the delay (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_secs(30),
            factor: 1.5,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * factor^attempt, cap)` without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(64) as i32);
        let millis = (self.base.as_millis() as f64 * exp).min(self.cap.as_millis() as f64);
        Duration::from_millis(millis.round() as u64)
    }

    /// Delay for `attempt` with jitter position `unit` in `[-1, 1]`
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let unit = unit.clamp(-1.0, 1.0);
        let millis = base * (1.0 + self.jitter * unit);
        Duration::from_millis(millis.max(0.0).round() as u64)
    }

    /// Delay for `attempt` with random jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with(attempt, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = 5;

    fn handle() -> ChannelHandle {
        ChannelHandle::new("realtime:jobs:update", Instant::now())
    }

    #[test]
    fn test_open_resets_retry_count() {
        let mut h = handle();
        let now = Instant::now();

        assert_eq!(
            h.apply(ChannelInput::Failed(FailureKind::ChannelError), MAX, now),
            Transition::ScheduleRetry { attempt: 0 }
        );
        assert_eq!(h.state, ChannelState::Degraded);
        assert_eq!(h.retry_count, 1);

        assert_eq!(h.apply(ChannelInput::RetryDue, MAX, now), Transition::Reopen);
        assert_eq!(h.state, ChannelState::Connecting);

        assert_eq!(h.apply(ChannelInput::Opened, MAX, now), Transition::Confirmed);
        assert_eq!(h.state, ChannelState::Open);
        assert_eq!(h.retry_count, 0);
    }

    #[test]
    fn test_fifth_consecutive_failure_gives_up() {
        let mut h = handle();
        let now = Instant::now();

        for attempt in 0..4 {
            assert_eq!(
                h.apply(ChannelInput::Failed(FailureKind::TimedOut), MAX, now),
                Transition::ScheduleRetry { attempt }
            );
            assert_eq!(h.apply(ChannelInput::RetryDue, MAX, now), Transition::Reopen);
        }

        assert_eq!(
            h.apply(ChannelInput::Failed(FailureKind::TimedOut), MAX, now),
            Transition::GiveUp { attempts: 5 }
        );
        assert_eq!(h.state, ChannelState::Closed);
        assert_eq!(h.apply(ChannelInput::RetryDue, MAX, now), Transition::Ignored);
        assert_eq!(h.apply(ChannelInput::Opened, MAX, now), Transition::Ignored);
    }

    #[test]
    fn test_failure_while_degraded_does_not_double_schedule() {
        let mut h = handle();
        let now = Instant::now();

        h.apply(ChannelInput::Failed(FailureKind::ChannelError), MAX, now);
        assert_eq!(
            h.apply(ChannelInput::Failed(FailureKind::Closed), MAX, now),
            Transition::Ignored
        );
        assert_eq!(h.retry_count, 1);
    }

    #[test]
    fn test_intentional_close_does_not_count_as_failure() {
        let mut h = handle();
        let now = Instant::now();
        h.apply(ChannelInput::Opened, MAX, now);

        assert_eq!(h.apply(ChannelInput::CloseRequested, MAX, now), Transition::Release);
        assert_eq!(h.retry_count, 0);
        assert_eq!(
            h.apply(ChannelInput::Failed(FailureKind::Closed), MAX, now),
            Transition::Ignored
        );
        assert_eq!(h.retry_count, 0);
    }

    #[test]
    fn test_force_reconnect_keeps_retry_count() {
        let mut h = handle();
        let now = Instant::now();
        h.apply(ChannelInput::Opened, MAX, now);

        assert_eq!(h.apply(ChannelInput::ForceReconnect, MAX, now), Transition::Reopen);
        assert_eq!(h.state, ChannelState::Connecting);
        assert_eq!(h.retry_count, 0);
    }

    #[test]
    fn test_backoff_non_decreasing_up_to_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(3000),
            ..Default::default()
        };

        let delays: Vec<Duration> = (0..5).map(|n| policy.base_delay(n)).collect();
        assert_eq!(delays[0], Duration::from_millis(1000));
        assert_eq!(delays[1], Duration::from_millis(1500));
        assert_eq!(delays[2], Duration::from_millis(2250));
        assert_eq!(delays[3], Duration::from_millis(3000));
        assert_eq!(delays[4], Duration::from_millis(3000));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_with(0, -1.0), Duration::from_millis(800));
        assert_eq!(policy.delay_with(0, 1.0), Duration::from_millis(1200));
        assert_eq!(policy.delay_with(0, 0.0), Duration::from_millis(1000));

        for _ in 0..100 {
            let d = policy.delay(0);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }
}
