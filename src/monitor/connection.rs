//! Connection Monitor
//!
//! Owns every physical channel: opens it through the capability adapter,
//! feeds provider status callbacks into the channel state machine, schedules
//! reconnects with backoff, and runs the periodic health check.
//!
//! Provider I/O and timers run in spawned tasks. The channel map is only
//! touched under the monitor's lock, which is never held across an await
//! and never held while bus handlers or subscriber callbacks run.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::state::{
    BackoffPolicy, ChannelHandle, ChannelInput, ChannelState, FailureKind, Transition,
};
use super::ChangeSink;
use crate::bus::{BusEvent, EventBus};
use crate::dedup::{EventDeduper, EventFingerprint};
use crate::heartbeat::HEARTBEAT_EVENT;
use crate::provider::{
    BroadcastPayload, CapabilityAdapter, ChannelSignal, ChannelStatus, ProviderChannel,
    ProviderError, ProviderResult,
};
use crate::registry::SubscriptionDescriptor;

/// Broadcast event name carrying generic status updates
pub const STATUS_UPDATE_EVENT: &str = "status_update";

/// Configuration for the connection monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Consecutive failures after which a channel gives up
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffPolicy,
    pub health_check_interval: Duration,
    /// Idle time after which an open channel is suspected stalled
    pub stalled_threshold: Duration,
    /// Second look before a suspected stall forces a reconnect
    pub stall_confirm_delay: Duration,
    /// No channel open for this long triggers a reconnect sweep
    pub all_down_timeout: Duration,
    /// How long an unused channel is kept warm before closing
    pub close_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            backoff: BackoffPolicy::default(),
            health_check_interval: Duration::from_secs(60),
            stalled_threshold: Duration::from_secs(5 * 60),
            stall_confirm_delay: Duration::from_secs(30),
            all_down_timeout: Duration::from_secs(2 * 60),
            close_grace: Duration::ZERO,
        }
    }
}

/// Point-in-time view of one channel
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub name: String,
    pub descriptor: String,
    pub state: ChannelState,
    pub connected: bool,
    pub subscriber_count: usize,
    pub retry_count: u32,
    pub idle_ms: u64,
    pub draining: bool,
}

/// Point-in-time view of the whole monitor
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub captured_at: DateTime<Utc>,
    pub connected: bool,
    pub channels: Vec<ChannelSnapshot>,
}

#[derive(Debug, Deserialize)]
struct StatusBroadcast {
    entity_id: String,
    status: String,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Retry,
    StallConfirm,
}

#[derive(Default)]
struct EntryTasks {
    pump: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    confirm: Option<JoinHandle<()>>,
    close: Option<JoinHandle<()>>,
}

impl EntryTasks {
    fn abort_timers(&mut self) {
        for task in [self.retry.take(), self.confirm.take()].into_iter().flatten() {
            task.abort();
        }
    }

    fn abort_all(&mut self) {
        self.abort_timers();
        for task in [self.pump.take(), self.close.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

struct ChannelEntry {
    descriptor: SubscriptionDescriptor,
    handle: ChannelHandle,
    /// Bumped whenever an instance is retired; signals carry the epoch of
    /// the instance that produced them
    epoch: u64,
    channel: Option<Arc<dyn ProviderChannel>>,
    tasks: EntryTasks,
    /// Unused, waiting out the close grace period
    draining: bool,
}

#[derive(Default)]
struct MonitorState {
    channels: HashMap<String, ChannelEntry>,
    health_task: Option<JoinHandle<()>>,
    all_down_since: Option<Instant>,
    /// Signed out: keep descriptors, open nothing
    suspended: bool,
}

struct MonitorInner {
    config: MonitorConfig,
    adapter: Arc<CapabilityAdapter>,
    bus: Arc<EventBus>,
    deduper: Arc<EventDeduper>,
    sink: Arc<dyn ChangeSink>,
    state: Mutex<MonitorState>,
    connected: AtomicBool,
}

/// Lifecycle owner of all physical channels
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectionMonitor {
    pub fn new(
        config: MonitorConfig,
        adapter: Arc<CapabilityAdapter>,
        bus: Arc<EventBus>,
        deduper: Arc<EventDeduper>,
        sink: Arc<dyn ChangeSink>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                adapter,
                bus,
                deduper,
                sink,
                state: Mutex::new(MonitorState::default()),
                connected: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Start the periodic health check. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut st = self.inner.state.lock();
        if st.health_task.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_check_interval;
        st.health_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.run_health_check();
            }
        }));

        tracing::debug!(
            interval_secs = period.as_secs(),
            "Connection health check started"
        );
    }

    /// Add one subscriber to the channel for `descriptor`, opening it on
    /// the first one
    pub fn retain(&self, descriptor: &SubscriptionDescriptor) {
        let events = self.inner.retain(descriptor);
        self.publish(events);
    }

    /// Remove one subscriber; the last one closes the channel
    pub fn release(&self, key: &str) {
        let events = self.inner.release(key);
        self.publish(events);
    }

    /// [`retain`](Self::retain) without emitting; the caller publishes the
    /// returned events once it holds no locks of its own
    pub(crate) fn retain_deferred(&self, descriptor: &SubscriptionDescriptor) -> Vec<BusEvent> {
        self.inner.retain(descriptor)
    }

    /// [`release`](Self::release) without emitting
    pub(crate) fn release_deferred(&self, key: &str) -> Vec<BusEvent> {
        self.inner.release(key)
    }

    pub(crate) fn publish(&self, events: Vec<BusEvent>) {
        self.inner.emit_all(events);
    }

    /// Reconnect a channel now, regardless of its state
    pub fn force_reconnect(&self, key: &str) -> bool {
        self.inner
            .handle_input(key, None, ChannelInput::ForceReconnect)
            .is_some()
    }

    /// Report a failure detected outside the provider (e.g. heartbeat timeout)
    pub fn fail(&self, key: &str, kind: FailureKind) -> bool {
        self.inner
            .handle_input(key, None, ChannelInput::Failed(kind))
            .is_some()
    }

    /// Tear down every channel and reopen one per retained descriptor
    pub fn reconnect_all(&self) {
        self.inner.reconnect_all();
    }

    /// The application became visible or came back online
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Close all channels but keep their descriptors for a later
    /// [`reconnect_all`](Self::reconnect_all) (sign-out)
    pub fn suspend(&self) {
        self.inner.suspend();
    }

    pub fn run_health_check(&self) {
        self.inner.run_health_check();
    }

    /// Send a broadcast on the channel for descriptor `key`
    pub async fn send(&self, key: &str, payload: BroadcastPayload) -> ProviderResult<()> {
        let channel = {
            let st = self.inner.state.lock();
            st.channels.get(key).and_then(|e| e.channel.clone())
        }
        .ok_or_else(|| ProviderError::NotConnected(key.to_string()))?;

        self.inner.adapter.send(&channel, payload).await
    }

    pub fn state_of(&self, key: &str) -> Option<ChannelState> {
        self.inner
            .state
            .lock()
            .channels
            .get(key)
            .map(|e| e.handle.state)
    }

    pub fn handle(&self, key: &str) -> Option<ChannelHandle> {
        self.inner
            .state
            .lock()
            .channels
            .get(key)
            .map(|e| e.handle.clone())
    }

    /// Whether any channel is open
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Channels with at least one subscriber
    pub fn channel_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .channels
            .values()
            .filter(|e| !e.draining)
            .count()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let now = Instant::now();
        let st = self.inner.state.lock();
        let mut channels: Vec<ChannelSnapshot> = st
            .channels
            .iter()
            .map(|(key, entry)| ChannelSnapshot {
                name: entry.handle.name.clone(),
                descriptor: key.clone(),
                state: entry.handle.state,
                connected: entry.handle.state == ChannelState::Open,
                subscriber_count: entry.handle.subscriber_count,
                retry_count: entry.handle.retry_count,
                idle_ms: entry.handle.idle_for(now).as_millis() as u64,
                draining: entry.draining,
            })
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));

        MonitorSnapshot {
            captured_at: Utc::now(),
            connected: self.is_connected(),
            channels,
        }
    }

    /// Stop the health check and close every channel
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl MonitorInner {
    fn retain(self: &Arc<Self>, descriptor: &SubscriptionDescriptor) -> Vec<BusEvent> {
        let key = descriptor.key();
        let now = Instant::now();
        let mut events = Vec::new();

        {
            let mut st = self.state.lock();
            let suspended = st.suspended;

            match st.channels.entry(key.clone()) {
                Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    entry.handle.subscriber_count += 1;

                    if entry.draining {
                        entry.draining = false;
                        if let Some(task) = entry.tasks.close.take() {
                            task.abort();
                        }
                        tracing::debug!(channel = %entry.handle.name, "Channel reclaimed during close grace");
                    }

                    // Gave up earlier; a new subscriber earns a fresh attempt
                    if entry.handle.state == ChannelState::Closed && !suspended {
                        entry.handle.reset(now);
                        self.start_instance(&key, entry);
                        events.push(status_event(entry));
                    }
                }
                Entry::Vacant(vacant) => {
                    let mut handle = ChannelHandle::new(descriptor.channel_name(), now);
                    handle.subscriber_count = 1;

                    let entry = vacant.insert(ChannelEntry {
                        descriptor: descriptor.clone(),
                        handle,
                        epoch: 0,
                        channel: None,
                        tasks: EntryTasks::default(),
                        draining: false,
                    });

                    if suspended {
                        entry.handle.state = ChannelState::Closed;
                    } else {
                        self.start_instance(&key, entry);
                        events.push(status_event(entry));
                    }
                    tracing::info!(channel = %entry.handle.name, "Channel created");
                }
            }

            self.refresh_connectivity(&mut st, now, &mut events);
        }

        events
    }

    fn release(self: &Arc<Self>, key: &str) -> Vec<BusEvent> {
        let now = Instant::now();
        let mut events = Vec::new();

        {
            let mut st = self.state.lock();
            let Some(entry) = st.channels.get_mut(key) else {
                tracing::debug!(descriptor = %key, "Release for unknown channel ignored");
                return events;
            };

            entry.handle.subscriber_count = entry.handle.subscriber_count.saturating_sub(1);
            if entry.handle.subscriber_count > 0 {
                return events;
            }

            let grace = self.config.close_grace;
            if grace.is_zero() {
                if let Some(mut entry) = st.channels.remove(key) {
                    self.close_entry(&mut entry, &mut events);
                }
            } else if !entry.draining {
                entry.draining = true;
                let weak = Arc::downgrade(self);
                let key = key.to_string();
                entry.tasks.close = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.finish_release(&key);
                    }
                }));
                tracing::debug!(
                    channel = %entry.handle.name,
                    grace_ms = grace.as_millis() as u64,
                    "Last subscriber left, closing after grace period"
                );
            }

            self.refresh_connectivity(&mut st, now, &mut events);
        }

        events
    }

    fn finish_release(self: &Arc<Self>, key: &str) {
        let now = Instant::now();
        let mut events = Vec::new();

        {
            let mut st = self.state.lock();
            let still_unused = st
                .channels
                .get(key)
                .is_some_and(|e| e.draining && e.handle.subscriber_count == 0);
            if !still_unused {
                return;
            }

            if let Some(mut entry) = st.channels.remove(key) {
                // This task is the close timer; do not abort it
                drop(entry.tasks.close.take());
                self.close_entry(&mut entry, &mut events);
            }
            self.refresh_connectivity(&mut st, now, &mut events);
        }

        self.emit_all(events);
    }

    /// Feed `input` to the channel's state machine and carry out the result.
    /// `epoch` filters out signals from retired instances.
    fn handle_input(
        self: &Arc<Self>,
        key: &str,
        epoch: Option<u64>,
        input: ChannelInput,
    ) -> Option<Transition> {
        let now = Instant::now();
        let mut events = Vec::new();

        let transition = {
            let mut st = self.state.lock();
            let entry = st.channels.get_mut(key)?;

            if epoch.is_some_and(|e| e != entry.epoch) {
                tracing::trace!(channel = %entry.handle.name, ?input, "Ignoring signal from retired instance");
                return None;
            }

            if entry.draining && matches!(input, ChannelInput::Failed(_)) {
                // Nobody is listening; close instead of retrying
                if let Some(mut entry) = st.channels.remove(key) {
                    self.close_entry(&mut entry, &mut events);
                }
                self.refresh_connectivity(&mut st, now, &mut events);
                drop(st);
                self.emit_all(events);
                return Some(Transition::Release);
            }

            let before = entry.handle.state;
            let transition =
                entry
                    .handle
                    .apply(input, self.config.max_reconnect_attempts, now);
            self.execute(key, entry, input, transition, &mut events);

            if entry.handle.state != before {
                events.push(status_event(entry));
            }

            self.refresh_connectivity(&mut st, now, &mut events);
            transition
        };

        self.emit_all(events);
        Some(transition)
    }

    fn execute(
        self: &Arc<Self>,
        key: &str,
        entry: &mut ChannelEntry,
        input: ChannelInput,
        transition: Transition,
        events: &mut Vec<BusEvent>,
    ) {
        match transition {
            Transition::Confirmed => {
                entry.tasks.abort_timers();
                tracing::info!(channel = %entry.handle.name, "Channel open");
            }
            Transition::ScheduleRetry { attempt } => {
                let delay = self.config.backoff.delay(attempt);
                tracing::warn!(
                    channel = %entry.handle.name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    reason = ?input,
                    "Channel failed, scheduling reconnect"
                );
                let task = self.spawn_timer(key, entry.epoch, Timer::Retry, delay);
                if let Some(old) = entry.tasks.retry.replace(task) {
                    old.abort();
                }
            }
            Transition::Reopen => {
                tracing::info!(channel = %entry.handle.name, reason = ?input, "Reconnecting channel");
                self.retire_instance(entry);
                self.start_instance(key, entry);
            }
            Transition::GiveUp { attempts } => {
                self.retire_instance(entry);
                tracing::error!(
                    channel = %entry.handle.name,
                    attempts,
                    "Reconnect attempts exhausted, giving up"
                );
                events.push(BusEvent::ConnectivityFatal {
                    channel: entry.handle.name.clone(),
                    attempts,
                });
            }
            Transition::Release => self.retire_instance(entry),
            Transition::Ignored => {}
        }
    }

    fn timer_fired(self: &Arc<Self>, key: &str, epoch: u64, timer: Timer) {
        {
            let mut st = self.state.lock();
            let Some(entry) = st.channels.get_mut(key) else {
                return;
            };
            if entry.epoch != epoch {
                return;
            }
            // Detach our own handle so the follow-up cannot abort us
            match timer {
                Timer::Retry => drop(entry.tasks.retry.take()),
                Timer::StallConfirm => drop(entry.tasks.confirm.take()),
            }
        }

        match timer {
            Timer::Retry => {
                self.handle_input(key, Some(epoch), ChannelInput::RetryDue);
            }
            Timer::StallConfirm => self.confirm_stall(key, epoch),
        }
    }

    fn confirm_stall(self: &Arc<Self>, key: &str, epoch: u64) {
        let now = Instant::now();
        let idle = {
            let st = self.state.lock();
            match st.channels.get(key) {
                Some(entry)
                    if entry.epoch == epoch
                        && entry.handle.state == ChannelState::Open
                        && !entry.draining =>
                {
                    entry.handle.idle_for(now)
                }
                _ => return,
            }
        };

        if idle > self.config.stalled_threshold {
            tracing::warn!(
                descriptor = %key,
                idle_secs = idle.as_secs(),
                "Channel still stalled, forcing reconnect"
            );
            self.handle_input(key, Some(epoch), ChannelInput::ForceReconnect);
        } else {
            tracing::debug!(descriptor = %key, "Channel recovered before stall confirmation");
        }
    }

    fn run_health_check(self: &Arc<Self>) {
        let now = Instant::now();
        self.deduper.evict(now);
        self.bus.evict(now);

        let mut sweep = false;
        {
            let mut st = self.state.lock();
            let threshold = self.config.stalled_threshold;

            for (key, entry) in st.channels.iter_mut() {
                if entry.handle.state != ChannelState::Open
                    || entry.draining
                    || entry.tasks.confirm.is_some()
                {
                    continue;
                }

                let idle = entry.handle.idle_for(now);
                if idle > threshold {
                    tracing::debug!(
                        channel = %entry.handle.name,
                        idle_secs = idle.as_secs(),
                        "Channel quiet past threshold, arming stall confirmation"
                    );
                    entry.tasks.confirm = Some(self.spawn_timer(
                        key,
                        entry.epoch,
                        Timer::StallConfirm,
                        self.config.stall_confirm_delay,
                    ));
                }
            }

            if let Some(since) = st.all_down_since {
                let stuck = st.channels.values().any(|e| {
                    matches!(
                        e.handle.state,
                        ChannelState::Connecting | ChannelState::Degraded
                    )
                });
                if stuck
                    && !st.suspended
                    && now.saturating_duration_since(since) > self.config.all_down_timeout
                {
                    st.all_down_since = Some(now);
                    sweep = true;
                }
            }
        }

        if sweep {
            tracing::warn!("No channel open for too long, reconnecting all");
            self.reconnect_all();
        }
    }

    fn resume(self: &Arc<Self>) {
        let now = Instant::now();
        let waiting: Vec<(String, u64)> = {
            let mut st = self.state.lock();
            let mut waiting = Vec::new();
            for (key, entry) in st.channels.iter_mut() {
                match entry.handle.state {
                    ChannelState::Open => entry.handle.last_event_at = now,
                    ChannelState::Degraded => {
                        if let Some(task) = entry.tasks.retry.take() {
                            task.abort();
                        }
                        waiting.push((key.clone(), entry.epoch));
                    }
                    _ => {}
                }
            }
            waiting
        };

        tracing::info!(pending_retries = waiting.len(), "Resumed, checking channel health");

        // Back online: do not sit out the remaining backoff
        for (key, epoch) in waiting {
            self.handle_input(&key, Some(epoch), ChannelInput::RetryDue);
        }
        self.run_health_check();
    }

    fn reconnect_all(self: &Arc<Self>) {
        let now = Instant::now();
        let mut events = Vec::new();

        let reopened = {
            let mut st = self.state.lock();
            st.suspended = false;
            st.all_down_since = None;

            let keys: Vec<String> = st.channels.keys().cloned().collect();
            let mut reopened = 0;
            for key in keys {
                let draining = st.channels.get(&key).is_some_and(|e| e.draining);
                if draining {
                    if let Some(mut entry) = st.channels.remove(&key) {
                        self.close_entry(&mut entry, &mut events);
                    }
                    continue;
                }

                if let Some(entry) = st.channels.get_mut(&key) {
                    let before = entry.handle.state;
                    self.retire_instance(entry);
                    entry.handle.reset(now);
                    self.start_instance(&key, entry);
                    if before != ChannelState::Connecting {
                        events.push(status_event(entry));
                    }
                    reopened += 1;
                }
            }

            self.refresh_connectivity(&mut st, now, &mut events);
            reopened
        };

        tracing::info!(channels = reopened, "Reconnecting all channels");
        self.emit_all(events);
    }

    fn suspend(self: &Arc<Self>) {
        let now = Instant::now();
        let mut events = Vec::new();

        {
            let mut st = self.state.lock();
            st.suspended = true;

            let keys: Vec<String> = st.channels.keys().cloned().collect();
            for key in keys {
                let draining = st.channels.get(&key).is_some_and(|e| e.draining);
                if draining {
                    if let Some(mut entry) = st.channels.remove(&key) {
                        self.close_entry(&mut entry, &mut events);
                    }
                } else if let Some(entry) = st.channels.get_mut(&key) {
                    self.close_entry(entry, &mut events);
                }
            }

            self.refresh_connectivity(&mut st, now, &mut events);
        }

        tracing::info!("Channels suspended");
        self.emit_all(events);
    }

    fn shutdown(self: &Arc<Self>) {
        let now = Instant::now();
        let mut events = Vec::new();

        {
            let mut st = self.state.lock();
            if let Some(task) = st.health_task.take() {
                task.abort();
            }
            st.suspended = true;

            let entries: Vec<ChannelEntry> = st.channels.drain().map(|(_, e)| e).collect();
            for mut entry in entries {
                self.close_entry(&mut entry, &mut events);
            }
            self.refresh_connectivity(&mut st, now, &mut events);
        }

        tracing::info!("Connection monitor shut down");
        self.emit_all(events);
    }

    /// Intentionally close an entry's current instance
    fn close_entry(&self, entry: &mut ChannelEntry, events: &mut Vec<BusEvent>) {
        let before = entry.handle.state;
        entry.handle.apply(
            ChannelInput::CloseRequested,
            self.config.max_reconnect_attempts,
            Instant::now(),
        );
        self.retire_instance(entry);
        entry.tasks.abort_all();

        if before != ChannelState::Closed {
            events.push(status_event(entry));
        }
        tracing::info!(channel = %entry.handle.name, "Channel closed");
    }

    /// Drop the current provider instance; its late signals become stale
    fn retire_instance(&self, entry: &mut ChannelEntry) {
        entry.epoch += 1;
        entry.tasks.abort_timers();
        if let Some(pump) = entry.tasks.pump.take() {
            pump.abort();
        }

        if let Some(channel) = entry.channel.take() {
            let adapter = Arc::clone(&self.adapter);
            tokio::spawn(async move {
                adapter.close(channel).await;
            });
        }
    }

    /// Open a new provider instance for an entry
    fn start_instance(self: &Arc<Self>, key: &str, entry: &mut ChannelEntry) {
        entry.epoch += 1;
        let epoch = entry.epoch;
        let (tx, rx) = mpsc::unbounded_channel();

        entry.tasks.pump = Some(tokio::spawn(pump(
            Arc::downgrade(self),
            key.to_string(),
            epoch,
            rx,
        )));

        let inner = Arc::clone(self);
        let key = key.to_string();
        let descriptor = entry.descriptor.clone();
        let name = entry.handle.name.clone();
        tokio::spawn(async move {
            match inner.adapter.open(&descriptor, &name, tx).await {
                Ok(channel) => inner.attach(&key, epoch, channel),
                Err(e) => {
                    tracing::warn!(channel = %name, error = %e, "Failed to open channel");
                    inner.handle_input(
                        &key,
                        Some(epoch),
                        ChannelInput::Failed(FailureKind::OpenFailed),
                    );
                }
            }
        });
    }

    /// Store a freshly opened provider channel unless its instance was
    /// retired while opening
    fn attach(&self, key: &str, epoch: u64, channel: Arc<dyn ProviderChannel>) {
        let stale = {
            let mut st = self.state.lock();
            match st.channels.get_mut(key) {
                Some(entry) if entry.epoch == epoch && entry.channel.is_none() => {
                    entry.channel = Some(channel);
                    None
                }
                _ => Some(channel),
            }
        };

        if let Some(channel) = stale {
            tracing::debug!(channel = %channel.name(), "Closing channel opened for retired instance");
            let adapter = Arc::clone(&self.adapter);
            tokio::spawn(async move {
                adapter.close(channel).await;
            });
        }
    }

    fn on_signal(self: &Arc<Self>, key: &str, epoch: u64, signal: ChannelSignal) {
        match signal {
            ChannelSignal::Status(status) => {
                let input = match status {
                    ChannelStatus::Open => ChannelInput::Opened,
                    ChannelStatus::TimedOut => ChannelInput::Failed(FailureKind::TimedOut),
                    ChannelStatus::ChannelError => ChannelInput::Failed(FailureKind::ChannelError),
                    ChannelStatus::Closed => ChannelInput::Failed(FailureKind::Closed),
                };
                tracing::debug!(descriptor = %key, ?status, "Provider status");
                self.handle_input(key, Some(epoch), input);
            }
            ChannelSignal::Change(change) => {
                let Some((descriptor, _)) = self.touch(key, epoch) else {
                    return;
                };

                if let Some(fingerprint) = EventFingerprint::from_payload(
                    &change,
                    descriptor.resource(),
                    &self.deduper.config().id_field,
                ) {
                    // Each descriptor gets its own copy of a change
                    if !self.deduper.should_process(key, &fingerprint) {
                        tracing::trace!(fingerprint = %fingerprint, "Dropped duplicate change");
                        return;
                    }
                }

                self.sink.deliver(key, &descriptor, &change);
            }
            ChannelSignal::Broadcast(message) => {
                let Some((descriptor, name)) = self.touch(key, epoch) else {
                    return;
                };
                self.on_broadcast(&descriptor, name, message);
            }
        }
    }

    fn on_broadcast(
        &self,
        descriptor: &SubscriptionDescriptor,
        channel: String,
        message: BroadcastPayload,
    ) {
        if descriptor.is_liveness() {
            if message.event == HEARTBEAT_EVENT {
                self.bus.emit(BusEvent::HeartbeatReceived { channel });
            }
            return;
        }

        if message.event != STATUS_UPDATE_EVENT {
            tracing::trace!(channel = %channel, event = %message.event, "Ignored broadcast");
            return;
        }

        match serde_json::from_value::<StatusBroadcast>(message.payload) {
            Ok(update) => {
                self.bus.emit(BusEvent::StatusUpdate {
                    entity_id: update.entity_id,
                    status: update.status,
                });
            }
            Err(e) => {
                tracing::debug!(channel = %channel, error = %e, "Malformed status broadcast");
            }
        }
    }

    /// Record activity on the current instance; None if the signal is stale
    fn touch(&self, key: &str, epoch: u64) -> Option<(SubscriptionDescriptor, String)> {
        let mut st = self.state.lock();
        let entry = st.channels.get_mut(key)?;
        if entry.epoch != epoch {
            return None;
        }
        entry.handle.last_event_at = Instant::now();
        Some((entry.descriptor.clone(), entry.handle.name.clone()))
    }

    fn spawn_timer(
        self: &Arc<Self>,
        key: &str,
        epoch: u64,
        timer: Timer,
        delay: Duration,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.timer_fired(&key, epoch, timer);
            }
        })
    }

    fn refresh_connectivity(&self, st: &mut MonitorState, now: Instant, events: &mut Vec<BusEvent>) {
        let any_open = st
            .channels
            .values()
            .any(|e| e.handle.state == ChannelState::Open);

        if any_open || st.channels.is_empty() {
            st.all_down_since = None;
        } else if st.all_down_since.is_none() {
            st.all_down_since = Some(now);
        }

        if self.connected.swap(any_open, Ordering::SeqCst) != any_open {
            tracing::info!(connected = any_open, "Connectivity changed");
            events.push(BusEvent::Connectivity {
                connected: any_open,
            });
        }
    }

    fn emit_all(&self, events: Vec<BusEvent>) {
        for event in events {
            self.bus.emit(event);
        }
    }
}

fn status_event(entry: &ChannelEntry) -> BusEvent {
    BusEvent::ChannelStatus {
        channel: entry.handle.name.clone(),
        state: entry.handle.state,
    }
}

/// Forward one instance's provider signals to the monitor, in order
async fn pump(
    inner: Weak<MonitorInner>,
    key: String,
    epoch: u64,
    mut rx: mpsc::UnboundedReceiver<ChannelSignal>,
) {
    while let Some(signal) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_signal(&key, epoch, signal);
    }
    tracing::trace!(descriptor = %key, epoch, "Signal pump finished");
}
