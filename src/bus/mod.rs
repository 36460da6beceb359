//! In-Process Event Bus
//!
//! Cross-feature fan-out for connectivity and change notifications: a status
//! change can update a sidebar badge and a profile card at the same time
//! without either knowing about the other.
//!
//! ## Events
//!
//! - `connectivity` - any channel connected (flips only)
//! - `channel_status` - per-channel state transitions
//! - `resource_changed` - deduplicated row changes
//! - `status_update` - generic status broadcasts
//! - `connectivity_fatal` - reconnect attempts exhausted, prompt a refresh
//! - `heartbeat_received` - liveness round trip confirmed

mod event_bus;
mod events;

pub use event_bus::{BusConfig, EventBus, Handler, ListenerKey};
pub use events::{BusEvent, EventKind};

pub(crate) use event_bus::panic_message;
