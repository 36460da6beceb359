//! Realtime Provider Seam
//!
//! Everything the resilience layer needs from the hosted realtime channel
//! provider and the "enable live updates" bootstrap RPC.
//!
//! ## Architecture
//!
//! - **ChannelProvider / ProviderChannel**: the five provider primitives
//!   (`channel`, `on`, `subscribe`, `send`, `remove_channel`)
//! - **BootstrapRpc**: one remote call per resource per process
//! - **CapabilityAdapter**: wraps both, adds the circuit breaker and the
//!   bootstrap success cache
//! - **MemoryProvider**: in-process loopback provider for tests and demos

mod adapter;
mod bootstrap;
mod breaker;
mod error;
pub mod memory;
mod messages;

pub use adapter::CapabilityAdapter;
pub use bootstrap::{HttpBootstrapClient, HttpBootstrapConfig};
pub use breaker::{BreakerConfig, BreakerStatus, CircuitBreaker};
pub use error::{ProviderError, ProviderResult};
pub use messages::{
    BroadcastPayload, ChangeKind, ChangePayload, ChangeSpec, ChannelConfig, ChannelSignal,
    ChannelStatus, SignalSink,
};

use async_trait::async_trait;
use std::sync::Arc;

/// The hosted realtime provider
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Create (but do not subscribe) a channel with the given name
    fn channel(&self, name: &str, config: ChannelConfig) -> Arc<dyn ProviderChannel>;

    /// Unsubscribe and drop a channel
    async fn remove_channel(&self, channel: Arc<dyn ProviderChannel>) -> ProviderResult<()>;
}

/// One physical channel created by a [`ChannelProvider`]
#[async_trait]
pub trait ProviderChannel: Send + Sync {
    /// Provider-side channel name
    fn name(&self) -> &str;

    /// Register interest in row changes; matching changes go to `sink`
    fn on(&self, spec: ChangeSpec, sink: SignalSink);

    /// Subscribe the channel; status callbacks and broadcasts go to `sink`
    async fn subscribe(&self, sink: SignalSink) -> ProviderResult<()>;

    /// Send a broadcast message over the channel
    async fn send(&self, payload: BroadcastPayload) -> ProviderResult<()>;
}

/// Remote "enable realtime for this resource" call
#[async_trait]
pub trait BootstrapRpc: Send + Sync {
    async fn enable_realtime(&self, resource: &str) -> ProviderResult<()>;
}
