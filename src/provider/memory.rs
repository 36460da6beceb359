//! In-Memory Loopback Provider
//!
//! A [`ChannelProvider`] that lives entirely inside the process. Channels
//! report `Open` as soon as they subscribe (unless told otherwise), echo
//! broadcasts back to themselves, and let the caller inject status changes
//! and row changes by channel name. Used by the demo binary and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::error::{ProviderError, ProviderResult};
use super::messages::{
    BroadcastPayload, ChangePayload, ChangeSpec, ChannelConfig, ChannelSignal, ChannelStatus,
    SignalSink,
};
use super::{BootstrapRpc, ChannelProvider, ProviderChannel};

#[derive(Default)]
struct ProviderState {
    /// Live channels by name
    live: HashMap<String, Arc<MemoryChannel>>,
    opened: HashMap<String, usize>,
    removed: HashMap<String, usize>,
    sent: HashMap<String, Vec<BroadcastPayload>>,
}

struct Shared {
    state: Mutex<ProviderState>,
    auto_open: AtomicBool,
    echo_broadcasts: AtomicBool,
    fail_subscribe: AtomicBool,
}

/// Loopback realtime provider
#[derive(Clone)]
pub struct MemoryProvider {
    shared: Arc<Shared>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ProviderState::default()),
                auto_open: AtomicBool::new(true),
                echo_broadcasts: AtomicBool::new(true),
                fail_subscribe: AtomicBool::new(false),
            }),
        }
    }

    /// Report `Open` automatically when a channel subscribes
    pub fn set_auto_open(&self, enabled: bool) {
        self.shared.auto_open.store(enabled, Ordering::SeqCst);
    }

    /// Deliver broadcasts back to channels configured with `broadcast_self`
    pub fn set_echo_broadcasts(&self, enabled: bool) {
        self.shared.echo_broadcasts.store(enabled, Ordering::SeqCst);
    }

    /// Make every subsequent `subscribe` call fail
    pub fn set_fail_subscribe(&self, enabled: bool) {
        self.shared.fail_subscribe.store(enabled, Ordering::SeqCst);
    }

    /// Push a status callback to the live channel `name`
    pub fn emit_status(&self, name: &str, status: ChannelStatus) -> bool {
        match self.live_channel(name) {
            Some(channel) => channel.push_status(ChannelSignal::Status(status)),
            None => false,
        }
    }

    /// Push a row change to every listener of the live channel `name`
    /// whose spec covers `resource`
    pub fn emit_change(&self, name: &str, resource: &str, payload: ChangePayload) -> bool {
        match self.live_channel(name) {
            Some(channel) => channel.push_change(resource, payload),
            None => false,
        }
    }

    /// How many times a channel with this name was created
    pub fn open_count(&self, name: &str) -> usize {
        self.shared.state.lock().opened.get(name).copied().unwrap_or(0)
    }

    /// How many times a channel with this name was removed
    pub fn remove_count(&self, name: &str) -> usize {
        self.shared.state.lock().removed.get(name).copied().unwrap_or(0)
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.shared.state.lock().live.contains_key(name)
    }

    /// Names of all live channels, sorted
    pub fn live_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.state.lock().live.keys().cloned().collect();
        names.sort();
        names
    }

    /// Broadcasts sent on channels with this name
    pub fn sent(&self, name: &str) -> Vec<BroadcastPayload> {
        self.shared
            .state
            .lock()
            .sent
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn live_channel(&self, name: &str) -> Option<Arc<MemoryChannel>> {
        self.shared.state.lock().live.get(name).cloned()
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelProvider for MemoryProvider {
    fn channel(&self, name: &str, config: ChannelConfig) -> Arc<dyn ProviderChannel> {
        let channel = Arc::new(MemoryChannel {
            name: name.to_string(),
            config,
            provider: Arc::downgrade(&self.shared),
            listeners: Mutex::new(Vec::new()),
            status_sink: Mutex::new(None),
        });

        let mut state = self.shared.state.lock();
        state.live.insert(name.to_string(), Arc::clone(&channel));
        *state.opened.entry(name.to_string()).or_insert(0) += 1;

        channel
    }

    async fn remove_channel(&self, channel: Arc<dyn ProviderChannel>) -> ProviderResult<()> {
        let name = channel.name().to_string();
        let mut state = self.shared.state.lock();

        // A newer instance may already be live under the same name
        let same_instance = state.live.get(&name).is_some_and(|live| {
            Arc::as_ptr(live) as *const () == Arc::as_ptr(&channel) as *const ()
        });
        if same_instance {
            state.live.remove(&name);
        }
        *state.removed.entry(name).or_insert(0) += 1;
        Ok(())
    }
}

/// A channel created by [`MemoryProvider`]
pub struct MemoryChannel {
    name: String,
    config: ChannelConfig,
    provider: Weak<Shared>,
    listeners: Mutex<Vec<(ChangeSpec, SignalSink)>>,
    status_sink: Mutex<Option<SignalSink>>,
}

impl MemoryChannel {
    fn push_status(&self, signal: ChannelSignal) -> bool {
        match self.status_sink.lock().as_ref() {
            Some(sink) => sink.send(signal).is_ok(),
            None => false,
        }
    }

    fn push_change(&self, resource: &str, payload: ChangePayload) -> bool {
        let listeners = self.listeners.lock();
        let mut delivered = false;
        for (spec, sink) in listeners.iter() {
            if spec.covers(resource, payload.change_kind)
                && sink.send(ChannelSignal::Change(payload.clone())).is_ok()
            {
                delivered = true;
            }
        }
        delivered
    }
}

#[async_trait]
impl ProviderChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on(&self, spec: ChangeSpec, sink: SignalSink) {
        self.listeners.lock().push((spec, sink));
    }

    async fn subscribe(&self, sink: SignalSink) -> ProviderResult<()> {
        let shared = self.provider.upgrade().ok_or(ProviderError::Unavailable)?;

        if shared.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ProviderError::Subscribe {
                channel: self.name.clone(),
                reason: "subscribe rejected".to_string(),
            });
        }

        if shared.auto_open.load(Ordering::SeqCst) {
            let _ = sink.send(ChannelSignal::Status(ChannelStatus::Open));
        }
        *self.status_sink.lock() = Some(sink);
        Ok(())
    }

    async fn send(&self, payload: BroadcastPayload) -> ProviderResult<()> {
        let shared = self.provider.upgrade().ok_or(ProviderError::Unavailable)?;

        shared
            .state
            .lock()
            .sent
            .entry(self.name.clone())
            .or_default()
            .push(payload.clone());

        if self.config.broadcast_self && shared.echo_broadcasts.load(Ordering::SeqCst) {
            self.push_status(ChannelSignal::Broadcast(payload));
        }
        Ok(())
    }
}

/// In-memory bootstrap RPC that counts calls and can be told to fail
#[derive(Default)]
pub struct MemoryBootstrap {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryBootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BootstrapRpc for MemoryBootstrap {
    async fn enable_realtime(&self, resource: &str) -> ProviderResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            Err(ProviderError::Rpc {
                status: 500,
                message: format!("cannot enable realtime for {}", resource),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChangeKind;
    use tokio::sync::mpsc;

    fn jobs_spec() -> ChangeSpec {
        ChangeSpec {
            resource: "jobs".to_string(),
            change_kind: ChangeKind::Update,
            filter: None,
        }
    }

    #[tokio::test]
    async fn test_subscribe_reports_open() {
        let provider = MemoryProvider::new();
        let channel = provider.channel("realtime:jobs", ChannelConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        channel.subscribe(tx).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(ChannelSignal::Status(ChannelStatus::Open))
        ));
        assert_eq!(provider.open_count("realtime:jobs"), 1);
        assert!(provider.is_live("realtime:jobs"));
    }

    #[tokio::test]
    async fn test_change_routed_by_spec() {
        let provider = MemoryProvider::new();
        let channel = provider.channel("realtime:jobs", ChannelConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on(jobs_spec(), tx);

        let update = ChangePayload::new(ChangeKind::Update, "T1");
        assert!(provider.emit_change("realtime:jobs", "jobs", update));

        let insert = ChangePayload::new(ChangeKind::Insert, "T2");
        assert!(!provider.emit_change("realtime:jobs", "jobs", insert));

        assert!(matches!(rx.recv().await, Some(ChannelSignal::Change(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_echo_and_removal() {
        let provider = MemoryProvider::new();
        provider.set_auto_open(false);
        let channel = provider.channel("liveness", ChannelConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe(tx).await.unwrap();

        channel
            .send(BroadcastPayload::new("heartbeat", serde_json::Value::Null))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(ChannelSignal::Broadcast(_))));
        assert_eq!(provider.sent("liveness").len(), 1);

        provider.remove_channel(channel).await.unwrap();
        assert!(!provider.is_live("liveness"));
        assert_eq!(provider.remove_count("liveness"), 1);
        assert!(!provider.emit_status("liveness", ChannelStatus::Closed));
    }

    #[tokio::test]
    async fn test_failing_bootstrap() {
        let bootstrap = MemoryBootstrap::new();
        assert!(bootstrap.enable_realtime("jobs").await.is_ok());
        bootstrap.set_failing(true);
        assert!(bootstrap.enable_realtime("jobs").await.is_err());
        assert_eq!(bootstrap.calls(), 2);
    }
}
