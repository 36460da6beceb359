//! Event Bus
//!
//! Typed in-process publish/subscribe. Handlers are registered per
//! [`EventKind`] under a handler key; registering again under the same key
//! replaces the handler instead of adding a second one, which keeps repeated
//! registration from re-rendering UI idempotent.

use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::events::{BusEvent, EventKind};

/// A bus handler
pub type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Key a handler was registered under
pub type ListenerKey = String;

/// Configuration for the event bus
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Listener count per kind that triggers a one-time warning
    pub max_listeners: usize,
    /// Same, for high-fan-out kinds
    pub high_fan_out_max_listeners: usize,
    /// Window in which an unchanged high-frequency event is suppressed
    pub dedup_window: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_listeners: 10,
            high_fan_out_max_listeners: 100,
            dedup_window: Duration::from_millis(1000),
        }
    }
}

struct Listener {
    key: ListenerKey,
    handler: Handler,
}

/// Last emission of a high-frequency event per (kind, subject)
struct LastEmit {
    payload: String,
    at: Instant,
}

/// Typed publish/subscribe bus
pub struct EventBus {
    config: BusConfig,
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
    recent: Mutex<HashMap<(EventKind, String), LastEmit>>,
    warned: Mutex<HashSet<EventKind>>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            listeners: RwLock::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Register `handler` for `kind`
    ///
    /// With a `handler_key` already registered for `kind`, the stored handler
    /// is replaced. Without a key a unique one is generated. Returns the key.
    pub fn on(&self, kind: EventKind, handler: Handler, handler_key: Option<&str>) -> ListenerKey {
        let mut listeners = self.listeners.write();
        let entries = listeners.entry(kind).or_default();

        if let Some(key) = handler_key {
            if let Some(existing) = entries.iter_mut().find(|l| l.key == key) {
                existing.handler = handler;
                tracing::trace!(event = %kind, handler_key = %key, "Replaced bus handler");
                return key.to_string();
            }
        }

        let key = handler_key
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        entries.push(Listener {
            key: key.clone(),
            handler,
        });

        let count = entries.len();
        drop(listeners);
        self.check_soft_cap(kind, count);

        key
    }

    /// Remove the handler registered under `key`
    pub fn off(&self, kind: EventKind, key: &str) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(&kind) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|l| l.key != key);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(&kind);
        }
        removed
    }

    /// Remove every registration of this exact handler
    pub fn off_handler(&self, kind: EventKind, handler: &Handler) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(&kind) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|l| !Arc::ptr_eq(&l.handler, handler));
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(&kind);
        }
        removed
    }

    /// Deliver `event` to every handler of its kind
    ///
    /// Returns false if the event was suppressed as a repeat or nobody is
    /// listening. A panicking handler is logged and skipped.
    pub fn emit(&self, event: BusEvent) -> bool {
        let kind = event.kind();

        if kind.is_high_frequency() && self.is_repeat(&event, Instant::now()) {
            tracing::trace!(event = %kind, subject = %event.subject(), "Suppressed repeated event");
            return false;
        }

        let handlers: Vec<(ListenerKey, Handler)> = self
            .listeners
            .read()
            .get(&kind)
            .map(|entries| {
                entries
                    .iter()
                    .map(|l| (l.key.clone(), Arc::clone(&l.handler)))
                    .collect()
            })
            .unwrap_or_default();

        if handlers.is_empty() {
            return false;
        }

        for (key, handler) in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                tracing::error!(
                    event = %kind,
                    handler_key = %key,
                    panic = %panic_message(panic.as_ref()),
                    "Bus handler panicked"
                );
            }
        }

        true
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Clear one kind, or the whole bus
    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        match kind {
            Some(kind) => {
                self.listeners.write().remove(&kind);
                self.warned.lock().remove(&kind);
                self.recent.lock().retain(|(k, _), _| *k != kind);
            }
            None => {
                self.listeners.write().clear();
                self.warned.lock().clear();
                self.recent.lock().clear();
            }
        }
    }

    /// Forget suppression state older than the dedup window
    pub fn evict(&self, now: Instant) {
        let window = self.config.dedup_window;
        self.recent
            .lock()
            .retain(|_, last| now.saturating_duration_since(last.at) < window);
    }

    fn is_repeat(&self, event: &BusEvent, now: Instant) -> bool {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(error = %e, "Unserializable event, skipping dedup");
                return false;
            }
        };

        let mut recent = self.recent.lock();
        let slot = (event.kind(), event.subject().to_string());

        if let Some(last) = recent.get(&slot) {
            if last.payload == payload
                && now.saturating_duration_since(last.at) < self.config.dedup_window
            {
                return true;
            }
        }

        recent.insert(slot, LastEmit { payload, at: now });
        if recent.len() > 256 {
            let window = self.config.dedup_window;
            recent.retain(|_, last| now.saturating_duration_since(last.at) < window);
        }
        false
    }

    fn check_soft_cap(&self, kind: EventKind, count: usize) {
        let cap = if kind.is_high_fan_out() {
            self.config.high_fan_out_max_listeners
        } else {
            self.config.max_listeners
        };

        if count > cap && self.warned.lock().insert(kind) {
            tracing::warn!(
                event = %kind,
                listeners = count,
                cap,
                "Possible listener leak: soft listener cap exceeded"
            );
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::ChannelState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Handler) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handler: Handler = Arc::new(move |_event: &BusEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    fn fatal(channel: &str) -> BusEvent {
        BusEvent::ConnectivityFatal {
            channel: channel.to_string(),
            attempts: 5,
        }
    }

    #[test]
    fn test_same_key_replaces_handler() {
        let bus = EventBus::default();
        let (first, h1) = counter();
        let (second, h2) = counter();

        bus.on(EventKind::ConnectivityFatal, h1, Some("sidebar"));
        bus.on(EventKind::ConnectivityFatal, h2, Some("sidebar"));
        assert_eq!(bus.listener_count(EventKind::ConnectivityFatal), 1);

        assert!(bus.emit(fatal("a")));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_generated_keys_do_not_collide() {
        let bus = EventBus::default();
        let (count, handler) = counter();

        let a = bus.on(EventKind::ConnectivityFatal, Arc::clone(&handler), None);
        let b = bus.on(EventKind::ConnectivityFatal, handler, None);
        assert_ne!(a, b);
        assert_eq!(bus.listener_count(EventKind::ConnectivityFatal), 2);

        bus.emit(fatal("a"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_off_by_key_and_by_handler() {
        let bus = EventBus::default();
        let (_, h1) = counter();
        let (_, h2) = counter();

        bus.on(EventKind::HeartbeatReceived, h1, Some("one"));
        bus.on(EventKind::HeartbeatReceived, Arc::clone(&h2), None);

        assert!(bus.off(EventKind::HeartbeatReceived, "one"));
        assert!(!bus.off(EventKind::HeartbeatReceived, "one"));
        assert!(bus.off_handler(EventKind::HeartbeatReceived, &h2));
        assert_eq!(bus.listener_count(EventKind::HeartbeatReceived), 0);
        assert!(!bus.emit(BusEvent::HeartbeatReceived {
            channel: "x".to_string()
        }));
    }

    #[test]
    fn test_panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::default();
        let (count, handler) = counter();

        bus.on(
            EventKind::ConnectivityFatal,
            Arc::new(|_event: &BusEvent| panic!("broken listener")),
            Some("broken"),
        );
        bus.on(EventKind::ConnectivityFatal, handler, Some("healthy"));

        assert!(bus.emit(fatal("a")));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_status_suppressed_within_window() {
        let bus = EventBus::default();
        let (count, handler) = counter();
        bus.on(EventKind::Connectivity, handler, None);

        assert!(bus.emit(BusEvent::Connectivity { connected: true }));
        assert!(!bus.emit(BusEvent::Connectivity { connected: true }));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(bus.emit(BusEvent::Connectivity { connected: true }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_flap_is_not_collapsed() {
        let bus = EventBus::default();
        let (count, handler) = counter();
        bus.on(EventKind::ChannelStatus, handler, None);

        let status = |state| BusEvent::ChannelStatus {
            channel: "realtime:jobs:update".to_string(),
            state,
        };
        assert!(bus.emit(status(ChannelState::Open)));
        assert!(bus.emit(status(ChannelState::Degraded)));
        assert!(bus.emit(status(ChannelState::Open)));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_non_status_events_always_fan_out() {
        let bus = EventBus::default();
        let (count, handler) = counter();
        bus.on(EventKind::ConnectivityFatal, handler, None);

        assert!(bus.emit(fatal("a")));
        assert!(bus.emit(fatal("a")));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_soft_cap_is_advisory() {
        let bus = EventBus::new(BusConfig {
            max_listeners: 2,
            ..Default::default()
        });
        for _ in 0..5 {
            let (_, handler) = counter();
            bus.on(EventKind::ConnectivityFatal, handler, None);
        }
        assert_eq!(bus.listener_count(EventKind::ConnectivityFatal), 5);
    }

    #[test]
    fn test_remove_all_listeners() {
        let bus = EventBus::default();
        let (_, h1) = counter();
        let (_, h2) = counter();
        bus.on(EventKind::ConnectivityFatal, h1, None);
        bus.on(EventKind::HeartbeatReceived, h2, None);

        bus.remove_all_listeners(Some(EventKind::ConnectivityFatal));
        assert_eq!(bus.listener_count(EventKind::ConnectivityFatal), 0);
        assert_eq!(bus.listener_count(EventKind::HeartbeatReceived), 1);

        bus.remove_all_listeners(None);
        assert_eq!(bus.listener_count(EventKind::HeartbeatReceived), 0);
    }
}
