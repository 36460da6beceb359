//! Provider Message Types
//!
//! Defines the payloads exchanged with the realtime channel provider:
//! change notifications, channel status callbacks and broadcast messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Kind of row change a subscription is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Wildcard: every change kind
    #[serde(rename = "*")]
    Any,
}

impl ChangeKind {
    /// Wire name used by the provider
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
            ChangeKind::Any => "*",
        }
    }

    /// Whether a subscription for `self` wants a change of kind `other`
    pub fn matches(&self, other: ChangeKind) -> bool {
        *self == ChangeKind::Any || *self == other
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification delivered by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    /// Kind of change (never `Any`)
    pub change_kind: ChangeKind,
    /// Row after the change (inserts and updates)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<serde_json::Value>,
    /// Row before the change (updates and deletes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<serde_json::Value>,
    /// Provider-assigned commit timestamp
    pub commit_timestamp: String,
}

impl ChangePayload {
    /// Create a payload with no row images
    pub fn new(change_kind: ChangeKind, commit_timestamp: impl Into<String>) -> Self {
        Self {
            change_kind,
            new: None,
            old: None,
            commit_timestamp: commit_timestamp.into(),
        }
    }

    /// Attach the new row image
    pub fn with_new(mut self, row: serde_json::Value) -> Self {
        self.new = Some(row);
        self
    }

    /// Attach the old row image
    pub fn with_old(mut self, row: serde_json::Value) -> Self {
        self.old = Some(row);
        self
    }

    /// Look up a field on the new row, falling back to the old row
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.new
            .as_ref()
            .and_then(|row| row.get(name))
            .or_else(|| self.old.as_ref().and_then(|row| row.get(name)))
    }
}

/// Status reported asynchronously by the provider for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    /// Channel subscribed and receiving
    #[serde(rename = "SUBSCRIBED")]
    Open,
    TimedOut,
    ChannelError,
    Closed,
}

impl ChannelStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, ChannelStatus::Open)
    }
}

/// A broadcast message sent over a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    /// Application-level event name (e.g. "heartbeat")
    pub event: String,
    /// Arbitrary JSON body
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl BroadcastPayload {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Which changes a channel listens for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSpec {
    pub resource: String,
    pub change_kind: ChangeKind,
    pub filter: Option<String>,
}

impl ChangeSpec {
    /// Whether a change on `resource` of kind `kind` is covered by this spec
    pub fn covers(&self, resource: &str, kind: ChangeKind) -> bool {
        self.resource == resource && self.change_kind.matches(kind)
    }
}

/// Options passed to the provider when a channel is created
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Deliver our own broadcasts back to us (heartbeat self-receipt)
    pub broadcast_self: bool,
    /// Ask the provider to acknowledge broadcasts
    pub broadcast_ack: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            broadcast_self: true,
            broadcast_ack: false,
        }
    }
}

/// Everything a provider channel can report back to us
#[derive(Debug, Clone)]
pub enum ChannelSignal {
    Status(ChannelStatus),
    Change(ChangePayload),
    Broadcast(BroadcastPayload),
}

/// Sender half handed to the provider for a single channel instance
pub type SignalSink = mpsc::UnboundedSender<ChannelSignal>;
