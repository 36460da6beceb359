//! # Livesync
//!
//! Realtime subscription and connection-resilience layer. Many UI features
//! subscribe to row changes; livesync multiplexes them onto one physical
//! channel per descriptor, keeps those channels alive through transport
//! failures, drops duplicate deliveries, and fans changes and connectivity
//! out over an in-process event bus.
//!
//! ## Features
//!
//! - **Shared channels**: ref-counted, one per subscription descriptor
//! - **Reconnect**: explicit state machine, exponential backoff with jitter
//! - **Health checks**: stall detection and full reconnect sweeps
//! - **Heartbeats**: liveness channel with timeout detection and keep-alive
//! - **Deduplication**: bounded fingerprint ring for redeliveries and echoes
//! - **Bootstrap**: "enable realtime" RPC behind a circuit breaker
//!
//! ## Modules
//!
//! - [`bus`]: Typed publish/subscribe
//! - [`dedup`]: Change fingerprints and the deduper
//! - [`registry`]: Subscriptions and callbacks
//! - [`monitor`]: Channel lifecycle and recovery
//! - [`heartbeat`]: Liveness and keep-alive
//! - [`provider`]: Provider seam, bootstrap client, loopback provider
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use livesync::provider::memory::MemoryProvider;
//! use livesync::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = RealtimeService::new(
//!         RealtimeConfig::default(),
//!         Collaborators {
//!             provider: Arc::new(MemoryProvider::new()),
//!             bootstrap: None,
//!             session: Arc::new(WatchSession::signed_in()),
//!             keep_alive: Arc::new(NoopKeepAlive),
//!         },
//!     );
//!     service.start().await?;
//!
//!     let jobs = SubscriptionDescriptor::new("jobs", ChangeKind::Update);
//!     let subscription = service.subscribe(jobs, |change| {
//!         println!("job changed: {:?}", change.new);
//!     });
//!
//!     subscription.unsubscribe();
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod dedup;
pub mod error;
pub mod heartbeat;
pub mod monitor;
pub mod provider;
pub mod registry;
pub mod service;
pub mod session;

// Re-export top-level types for convenience
pub use bus::{BusConfig, BusEvent, EventBus, EventKind, Handler, ListenerKey};

pub use dedup::{DedupConfig, EventDeduper, EventFingerprint};

pub use registry::{ChangeCallback, Subscription, SubscriptionDescriptor, SubscriptionRegistry};

pub use monitor::{
    BackoffPolicy, ChannelSnapshot, ChannelState, ConnectionMonitor, FailureKind, MonitorConfig,
    MonitorSnapshot,
};

pub use heartbeat::{
    HeartbeatConfig, HeartbeatKeeper, KeepAlive, KeepAliveError, KeepAliveLease, NoopKeepAlive,
};

pub use provider::{
    BootstrapRpc, BreakerConfig, BreakerStatus, BroadcastPayload, CapabilityAdapter, ChangeKind,
    ChangePayload, ChannelConfig, ChannelProvider, ChannelStatus, HttpBootstrapClient,
    HttpBootstrapConfig, ProviderChannel, ProviderError, ProviderResult,
};

pub use error::{RealtimeError, RealtimeResult};

pub use service::{Collaborators, NetworkStatus, RealtimeConfig, RealtimeService, Visibility};

pub use session::{SessionProvider, SessionState, WatchSession};

pub use config::{Config, ConfigError, LoggingConfig};
