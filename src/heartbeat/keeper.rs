//! Heartbeat Keeper
//!
//! Keeps a dedicated liveness channel open and broadcasts a heartbeat over
//! it on a fixed interval. The provider echoes broadcasts back to the
//! sender, so self-receipt confirms the round trip. A second timer checks
//! for silence and asks the monitor to fail the liveness channel, at most
//! once per successful open.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::keep_alive::{KeepAlive, KeepAliveLease};
use crate::bus::{BusEvent, EventBus, EventKind, Handler};
use crate::monitor::{ChannelState, ConnectionMonitor, FailureKind};
use crate::provider::BroadcastPayload;
use crate::registry::SubscriptionDescriptor;

/// Broadcast event name of heartbeats
pub const HEARTBEAT_EVENT: &str = "heartbeat";

const RECEIVED_HANDLER_KEY: &str = "heartbeat-keeper:received";
const STATUS_HANDLER_KEY: &str = "heartbeat-keeper:status";

/// Configuration for the heartbeat keeper
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between heartbeats
    pub interval: Duration,
    /// Silence after which the liveness channel is failed
    pub timeout: Duration,
    /// How often silence is checked
    pub check_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(35),
            check_interval: Duration::from_secs(5),
        }
    }
}

struct KeeperState {
    running: bool,
    foreground: bool,
    last_heartbeat_at: Option<Instant>,
    /// A reconnect was requested and no Open has been seen since
    reconnect_requested: bool,
    tasks: Vec<JoinHandle<()>>,
}

struct KeeperInner {
    config: HeartbeatConfig,
    monitor: ConnectionMonitor,
    bus: Arc<EventBus>,
    keep_alive: Arc<dyn KeepAlive>,
    liveness: SubscriptionDescriptor,
    liveness_name: String,
    state: Mutex<KeeperState>,
    lease: tokio::sync::Mutex<Option<KeepAliveLease>>,
}

/// Liveness probe and keep-alive holder
#[derive(Clone)]
pub struct HeartbeatKeeper {
    inner: Arc<KeeperInner>,
}

impl HeartbeatKeeper {
    pub fn new(
        config: HeartbeatConfig,
        monitor: ConnectionMonitor,
        bus: Arc<EventBus>,
        keep_alive: Arc<dyn KeepAlive>,
    ) -> Self {
        let liveness = SubscriptionDescriptor::liveness();
        let liveness_name = liveness.channel_name();

        Self {
            inner: Arc::new(KeeperInner {
                config,
                monitor,
                bus,
                keep_alive,
                liveness,
                liveness_name,
                state: Mutex::new(KeeperState {
                    running: false,
                    foreground: true,
                    last_heartbeat_at: None,
                    reconnect_requested: false,
                    tasks: Vec::new(),
                }),
                lease: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Open the liveness channel and start both timers
    pub async fn start(&self) {
        {
            let mut st = self.inner.state.lock();
            if st.running {
                return;
            }
            st.running = true;
            st.reconnect_requested = false;
            st.last_heartbeat_at = Some(Instant::now());
        }

        self.register_handlers();
        self.inner.monitor.retain(&self.inner.liveness);

        let send_task = spawn_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.interval,
            |inner| async move { inner.send_heartbeat().await },
        );
        let check_task = spawn_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.check_interval,
            |inner| async move { inner.check().await },
        );
        self.inner.state.lock().tasks = vec![send_task, check_task];

        self.inner.ensure_lease().await;

        tracing::info!(
            interval_secs = self.inner.config.interval.as_secs(),
            timeout_secs = self.inner.config.timeout.as_secs(),
            "Heartbeat started"
        );
    }

    /// Stop timers, drop the liveness channel and release the keep-alive
    pub async fn stop(&self) {
        let tasks = {
            let mut st = self.inner.state.lock();
            if !st.running {
                return;
            }
            st.running = false;
            std::mem::take(&mut st.tasks)
        };
        for task in tasks {
            task.abort();
        }

        self.inner.bus.off(EventKind::HeartbeatReceived, RECEIVED_HANDLER_KEY);
        self.inner.bus.off(EventKind::ChannelStatus, STATUS_HANDLER_KEY);
        self.inner.monitor.release(&self.inner.liveness.key());
        self.inner.release_lease().await;

        tracing::info!("Heartbeat stopped");
    }

    /// Foregrounding acquires the keep-alive, backgrounding releases it
    pub async fn set_foreground(&self, foreground: bool) {
        let running = {
            let mut st = self.inner.state.lock();
            st.foreground = foreground;
            st.running
        };

        if !foreground {
            self.inner.release_lease().await;
        } else if running {
            self.inner.ensure_lease().await;
        }
    }

    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        self.inner.state.lock().last_heartbeat_at
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    pub async fn holds_keep_alive(&self) -> bool {
        self.inner
            .lease
            .lock()
            .await
            .as_ref()
            .is_some_and(KeepAliveLease::is_held)
    }

    fn register_handlers(&self) {
        let weak = Arc::downgrade(&self.inner);
        let received: Handler = Arc::new(move |event: &BusEvent| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let BusEvent::HeartbeatReceived { channel } = event {
                if *channel == inner.liveness_name {
                    inner.state.lock().last_heartbeat_at = Some(Instant::now());
                    tracing::trace!("Heartbeat echo received");
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let status: Handler = Arc::new(move |event: &BusEvent| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let BusEvent::ChannelStatus { channel, state } = event {
                if *channel == inner.liveness_name && *state == ChannelState::Open {
                    let mut st = inner.state.lock();
                    st.reconnect_requested = false;
                    st.last_heartbeat_at = Some(Instant::now());
                }
            }
        });

        self.inner
            .bus
            .on(EventKind::HeartbeatReceived, received, Some(RECEIVED_HANDLER_KEY));
        self.inner
            .bus
            .on(EventKind::ChannelStatus, status, Some(STATUS_HANDLER_KEY));
    }
}

impl KeeperInner {
    async fn send_heartbeat(&self) {
        let payload = BroadcastPayload::new(
            HEARTBEAT_EVENT,
            serde_json::json!({ "sent_at": Utc::now().to_rfc3339() }),
        );

        match self.monitor.send(&self.liveness.key(), payload).await {
            Ok(()) => {
                self.state.lock().last_heartbeat_at = Some(Instant::now());
                tracing::trace!("Heartbeat sent");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Heartbeat not sent");
            }
        }
    }

    async fn check(&self) {
        let now = Instant::now();
        let key = self.liveness.key();
        let open = self.monitor.state_of(&key) == Some(ChannelState::Open);

        let silent_for = {
            let mut st = self.state.lock();
            let silent = st
                .last_heartbeat_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();

            if open && !st.reconnect_requested && silent > self.config.timeout {
                st.reconnect_requested = true;
                Some(silent)
            } else {
                None
            }
        };

        if let Some(silent) = silent_for {
            tracing::warn!(
                silent_secs = silent.as_secs(),
                "Heartbeat timed out, reconnecting liveness channel"
            );
            self.monitor.fail(&key, FailureKind::HeartbeatTimeout);
        }

        self.ensure_lease().await;
    }

    /// Hold a keep-alive while foregrounded, replacing one the platform dropped
    async fn ensure_lease(&self) {
        if !self.state.lock().foreground {
            return;
        }

        let mut lease = self.lease.lock().await;
        if lease.as_ref().is_some_and(KeepAliveLease::is_held) {
            return;
        }
        if let Some(revoked) = lease.take() {
            revoked.into_revoked();
            tracing::debug!("Keep-alive released by platform, re-acquiring");
        }

        match KeepAliveLease::acquire(Arc::clone(&self.keep_alive)).await {
            Ok(acquired) => {
                *lease = Some(acquired);
                tracing::debug!("Keep-alive acquired");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to acquire keep-alive");
            }
        }
    }

    async fn release_lease(&self) {
        if self.lease.lock().await.take().is_some() {
            tracing::debug!("Keep-alive released");
        }
    }
}

/// Run `tick` every `period`, skipping the immediate first tick
fn spawn_loop<F, Fut>(inner: Weak<KeeperInner>, period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(Arc<KeeperInner>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            tick(inner).await;
        }
    })
}
