//! Connection Monitoring
//!
//! Tracks every physical channel through its lifecycle and recovers from
//! failures.
//!
//! ## Architecture
//!
//! - `state` - channel state machine and reconnect backoff
//! - `connection` - channel ownership, provider signal pumps, timers, health check

mod connection;
mod state;

pub use connection::{
    ChannelSnapshot, ConnectionMonitor, MonitorConfig, MonitorSnapshot, STATUS_UPDATE_EVENT,
};
pub use state::{
    BackoffPolicy, ChannelHandle, ChannelInput, ChannelState, FailureKind, Transition,
};

use crate::provider::ChangePayload;
use crate::registry::SubscriptionDescriptor;

/// Receives deduplicated changes from the monitor
pub trait ChangeSink: Send + Sync {
    /// `key` is the descriptor key the change arrived for
    fn deliver(&self, key: &str, descriptor: &SubscriptionDescriptor, change: &ChangePayload);
}
