//! Heartbeats and Keep-Alive
//!
//! ## Architecture
//!
//! - `keeper` - liveness channel, heartbeat and timeout timers
//! - `keep_alive` - platform wake-lock seam and its scoped lease

mod keep_alive;
mod keeper;

pub use keep_alive::{KeepAlive, KeepAliveError, KeepAliveLease, MemoryKeepAlive, NoopKeepAlive};
pub use keeper::{HeartbeatConfig, HeartbeatKeeper, HEARTBEAT_EVENT};
