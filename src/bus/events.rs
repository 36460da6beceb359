//! Bus Event Types
//!
//! Every event the resilience layer publishes to the rest of the
//! application. Event names are a closed enum so a typo is a compile error.

use serde::Serialize;
use std::fmt;

use crate::monitor::ChannelState;
use crate::provider::ChangePayload;

/// Name of a bus event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Process-wide "any channel connected" flipped
    Connectivity,
    /// A channel changed state
    ChannelStatus,
    /// A deduplicated row change arrived for a resource
    ResourceChanged,
    /// Generic status-update broadcast (presence, job status, ...)
    StatusUpdate,
    /// Reconnect attempts exhausted for a channel
    ConnectivityFatal,
    /// A heartbeat came back on the liveness channel
    HeartbeatReceived,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connectivity => "connectivity",
            EventKind::ChannelStatus => "channel_status",
            EventKind::ResourceChanged => "resource_changed",
            EventKind::StatusUpdate => "status_update",
            EventKind::ConnectivityFatal => "connectivity_fatal",
            EventKind::HeartbeatReceived => "heartbeat_received",
        }
    }

    /// Status-like events that flap; suppressed when repeated unchanged
    pub fn is_high_frequency(&self) -> bool {
        matches!(
            self,
            EventKind::Connectivity | EventKind::ChannelStatus | EventKind::StatusUpdate
        )
    }

    /// Events many surfaces listen to at once (badges, cards, lists)
    pub fn is_high_fan_out(&self) -> bool {
        matches!(
            self,
            EventKind::Connectivity | EventKind::ResourceChanged | EventKind::StatusUpdate
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event published on the bus
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    Connectivity {
        connected: bool,
    },
    ChannelStatus {
        channel: String,
        state: ChannelState,
    },
    ResourceChanged {
        resource: String,
        /// Key of the descriptor the change was delivered for
        descriptor: String,
        change: ChangePayload,
    },
    StatusUpdate {
        entity_id: String,
        status: String,
    },
    ConnectivityFatal {
        channel: String,
        attempts: u32,
    },
    HeartbeatReceived {
        channel: String,
    },
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BusEvent::Connectivity { .. } => EventKind::Connectivity,
            BusEvent::ChannelStatus { .. } => EventKind::ChannelStatus,
            BusEvent::ResourceChanged { .. } => EventKind::ResourceChanged,
            BusEvent::StatusUpdate { .. } => EventKind::StatusUpdate,
            BusEvent::ConnectivityFatal { .. } => EventKind::ConnectivityFatal,
            BusEvent::HeartbeatReceived { .. } => EventKind::HeartbeatReceived,
        }
    }

    /// What a high-frequency event is about
    ///
    /// Repeats are compared against the last value emitted for the same
    /// kind and subject, so `Open, Degraded, Open` on one channel is never
    /// collapsed while a burst of identical `Open`s is.
    pub fn subject(&self) -> &str {
        match self {
            BusEvent::ChannelStatus { channel, .. } => channel,
            BusEvent::StatusUpdate { entity_id, .. } => entity_id,
            BusEvent::ResourceChanged { descriptor, .. } => descriptor,
            BusEvent::ConnectivityFatal { channel, .. } => channel,
            BusEvent::HeartbeatReceived { channel } => channel,
            BusEvent::Connectivity { .. } => "",
        }
    }
}
