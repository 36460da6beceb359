//! Realtime Service
//!
//! Application root of the resilience layer. Constructs and wires the bus,
//! deduper, adapter, monitor, registry and heartbeat keeper, and reacts to
//! session, visibility and network changes.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::bus::{BusConfig, EventBus};
use crate::dedup::{DedupConfig, EventDeduper};
use crate::error::{RealtimeError, RealtimeResult};
use crate::heartbeat::{HeartbeatConfig, HeartbeatKeeper, KeepAlive};
use crate::monitor::{ConnectionMonitor, MonitorConfig};
use crate::provider::{
    BootstrapRpc, BreakerConfig, BroadcastPayload, CapabilityAdapter, ChangePayload,
    ChannelConfig, ChannelProvider,
};
use crate::registry::{ListenerTable, Subscription, SubscriptionDescriptor, SubscriptionRegistry};
use crate::session::{SessionProvider, SessionState};

/// Runtime configuration of every component
#[derive(Debug, Clone, Default)]
pub struct RealtimeConfig {
    pub bus: BusConfig,
    pub dedup: DedupConfig,
    pub monitor: MonitorConfig,
    pub heartbeat: HeartbeatConfig,
    pub breaker: BreakerConfig,
    pub channel: ChannelConfig,
}

/// External systems the service depends on
pub struct Collaborators {
    pub provider: Arc<dyn ChannelProvider>,
    pub bootstrap: Option<Arc<dyn BootstrapRpc>>,
    pub session: Arc<dyn SessionProvider>,
    pub keep_alive: Arc<dyn KeepAlive>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Online,
    Offline,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    shut_down: bool,
    session_watcher: Option<JoinHandle<()>>,
}

/// Owns one isolated instance of the realtime layer
pub struct RealtimeService {
    bus: Arc<EventBus>,
    deduper: Arc<EventDeduper>,
    adapter: Arc<CapabilityAdapter>,
    monitor: ConnectionMonitor,
    registry: SubscriptionRegistry,
    heartbeat: HeartbeatKeeper,
    session: Arc<dyn SessionProvider>,
    lifecycle: Mutex<Lifecycle>,
}

impl RealtimeService {
    pub fn new(config: RealtimeConfig, collaborators: Collaborators) -> Self {
        let bus = Arc::new(EventBus::new(config.bus));
        let deduper = Arc::new(EventDeduper::new(config.dedup));
        let adapter = Arc::new(CapabilityAdapter::new(
            collaborators.provider,
            collaborators.bootstrap,
            config.breaker,
            config.channel,
        ));

        let listeners = Arc::new(ListenerTable::new(Some(Arc::clone(&bus))));
        let monitor = ConnectionMonitor::new(
            config.monitor,
            Arc::clone(&adapter),
            Arc::clone(&bus),
            Arc::clone(&deduper),
            listeners.clone(),
        );
        let registry = SubscriptionRegistry::new(listeners, monitor.clone(), Arc::clone(&deduper));
        let heartbeat = HeartbeatKeeper::new(
            config.heartbeat,
            monitor.clone(),
            Arc::clone(&bus),
            collaborators.keep_alive,
        );

        Self {
            bus,
            deduper,
            adapter,
            monitor,
            registry,
            heartbeat,
            session: collaborators.session,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Start health checks, heartbeats and the session watcher
    ///
    /// Without a session, channels stay closed until sign-in.
    pub async fn start(&self) -> RealtimeResult<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.shut_down {
                return Err(RealtimeError::ShutDown);
            }
            if lifecycle.started {
                return Err(RealtimeError::AlreadyStarted);
            }
            lifecycle.started = true;
        }

        self.monitor.start();
        if self.session.has_session() {
            self.heartbeat.start().await;
        } else {
            self.monitor.suspend();
            tracing::info!("No active session, channels wait for sign-in");
        }

        let mut rx = self.session.watch();
        let monitor = self.monitor.clone();
        let heartbeat = self.heartbeat.clone();
        let watcher = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                match state {
                    SessionState::SignedOut => {
                        tracing::info!("Signed out, tearing down channels");
                        heartbeat.stop().await;
                        monitor.suspend();
                    }
                    SessionState::SignedIn => {
                        tracing::info!("Signed in, restoring channels");
                        monitor.reconnect_all();
                        heartbeat.start().await;
                    }
                }
            }
        });
        self.lifecycle.lock().session_watcher = Some(watcher);

        tracing::info!("Realtime service started");
        Ok(())
    }

    /// Stop every timer and close every channel
    pub async fn shutdown(&self) {
        let watcher = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.shut_down {
                return;
            }
            lifecycle.shut_down = true;
            lifecycle.session_watcher.take()
        };
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        self.heartbeat.stop().await;
        self.monitor.shutdown();
        tracing::info!("Realtime service shut down");
    }

    pub async fn on_visibility(&self, visibility: Visibility) {
        match visibility {
            Visibility::Visible => {
                self.monitor.resume();
                self.heartbeat.set_foreground(true).await;
            }
            Visibility::Hidden => {
                self.heartbeat.set_foreground(false).await;
            }
        }
    }

    pub fn on_network(&self, status: NetworkStatus) {
        match status {
            NetworkStatus::Online => self.monitor.resume(),
            NetworkStatus::Offline => {
                tracing::debug!("Network offline, waiting for provider status");
            }
        }
    }

    pub fn subscribe<F>(&self, descriptor: SubscriptionDescriptor, callback: F) -> Subscription
    where
        F: Fn(&ChangePayload) + Send + Sync + 'static,
    {
        self.registry.subscribe(descriptor, callback)
    }

    /// Send a broadcast on the channel of an active subscription
    pub async fn broadcast(
        &self,
        descriptor: &SubscriptionDescriptor,
        payload: BroadcastPayload,
    ) -> RealtimeResult<()> {
        self.monitor.send(&descriptor.key(), payload).await?;
        Ok(())
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn heartbeat(&self) -> &HeartbeatKeeper {
        &self.heartbeat
    }

    pub fn adapter(&self) -> &Arc<CapabilityAdapter> {
        &self.adapter
    }

    pub fn deduper(&self) -> &Arc<EventDeduper> {
        &self.deduper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::MemoryKeepAlive;
    use crate::monitor::ChannelState;
    use crate::provider::memory::MemoryProvider;
    use crate::provider::ChangeKind;
    use crate::session::WatchSession;
    use std::time::Duration;

    fn service(session: Arc<WatchSession>) -> (MemoryProvider, Arc<MemoryKeepAlive>, RealtimeService) {
        let provider = MemoryProvider::new();
        let keep_alive = Arc::new(MemoryKeepAlive::new());
        let service = RealtimeService::new(
            RealtimeConfig::default(),
            Collaborators {
                provider: Arc::new(provider.clone()),
                bootstrap: None,
                session,
                keep_alive: keep_alive.clone(),
            },
        );
        (provider, keep_alive, service)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails() {
        let (_provider, _keep_alive, service) = service(Arc::new(WatchSession::signed_in()));
        service.start().await.unwrap();
        assert!(matches!(service.start().await, Err(RealtimeError::AlreadyStarted)));

        service.shutdown().await;
        assert!(matches!(service.start().await, Err(RealtimeError::ShutDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_tears_down_and_sign_in_restores() {
        let session = Arc::new(WatchSession::signed_in());
        let (provider, keep_alive, service) = service(session.clone());
        service.start().await.unwrap();

        let jobs = SubscriptionDescriptor::new("jobs", ChangeKind::Update);
        let _sub = service.subscribe(jobs.clone(), |_| {});
        settle().await;
        assert_eq!(
            provider.live_channels(),
            vec!["realtime:jobs:update".to_string(), "realtime:liveness".to_string()]
        );

        session.sign_out();
        settle().await;
        assert!(provider.live_channels().is_empty());
        assert!(!keep_alive.is_held());
        assert!(!service.heartbeat().is_running());
        assert_eq!(service.monitor().state_of(&jobs.key()), Some(ChannelState::Closed));

        session.sign_in();
        settle().await;
        assert_eq!(service.monitor().state_of(&jobs.key()), Some(ChannelState::Open));
        assert!(provider.is_live("realtime:liveness"));
        assert!(service.heartbeat().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_session_keeps_channels_closed() {
        let session = Arc::new(WatchSession::signed_out());
        let (provider, _keep_alive, service) = service(session.clone());
        service.start().await.unwrap();

        let jobs = SubscriptionDescriptor::new("jobs", ChangeKind::Update);
        let _sub = service.subscribe(jobs.clone(), |_| {});
        settle().await;
        assert!(provider.live_channels().is_empty());

        session.sign_in();
        settle().await;
        assert!(provider.is_live("realtime:jobs:update"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_requires_open_channel() {
        let (provider, _keep_alive, service) = service(Arc::new(WatchSession::signed_in()));
        service.start().await.unwrap();

        let jobs = SubscriptionDescriptor::new("jobs", ChangeKind::Update);
        let payload = BroadcastPayload::new("status_update", serde_json::json!({}));
        assert!(service.broadcast(&jobs, payload.clone()).await.is_err());

        let _sub = service.subscribe(jobs.clone(), |_| {});
        settle().await;
        service.broadcast(&jobs, payload).await.unwrap();
        assert_eq!(provider.sent("realtime:jobs:update").len(), 1);
    }
}
