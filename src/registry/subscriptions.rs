//! Subscription Registry
//!
//! Maps logical subscriptions onto shared physical channels. The first
//! subscriber of a descriptor makes the monitor open a channel; further
//! subscribers only add a callback; the last unsubscribe releases it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

use super::descriptor::SubscriptionDescriptor;
use super::listeners::{ChangeCallback, Insertion, ListenerTable};
use crate::dedup::{EventDeduper, EventFingerprint};
use crate::monitor::ConnectionMonitor;
use crate::provider::ChangePayload;

struct RegistryInner {
    listeners: Arc<ListenerTable>,
    monitor: ConnectionMonitor,
    deduper: Arc<EventDeduper>,
    /// Serializes table updates with the matching monitor retain/release
    ops: Mutex<()>,
}

/// Entry point for features that want row changes
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(
        listeners: Arc<ListenerTable>,
        monitor: ConnectionMonitor,
        deduper: Arc<EventDeduper>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                listeners,
                monitor,
                deduper,
                ops: Mutex::new(()),
            }),
        }
    }

    /// Subscribe `callback` to changes matching `descriptor`
    pub fn subscribe<F>(&self, descriptor: SubscriptionDescriptor, callback: F) -> Subscription
    where
        F: Fn(&ChangePayload) + Send + Sync + 'static,
    {
        let handler_key = Uuid::new_v4().to_string();
        self.subscribe_with_key(descriptor, &handler_key, callback)
    }

    /// Subscribe under a caller-chosen handler key
    ///
    /// Subscribing again with the same descriptor and key replaces the
    /// callback; no second callback is added and no extra channel
    /// reference is taken.
    pub fn subscribe_with_key<F>(
        &self,
        descriptor: SubscriptionDescriptor,
        handler_key: &str,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&ChangePayload) + Send + Sync + 'static,
    {
        let callback: ChangeCallback = Arc::new(callback);
        let key = descriptor.key();

        let events = {
            let _ops = self.inner.ops.lock();
            match self.inner.listeners.insert(&descriptor, handler_key, callback) {
                Insertion::Added => {
                    tracing::debug!(descriptor = %descriptor, handler_key = %handler_key, "Subscribed");
                    self.inner.monitor.retain_deferred(&descriptor)
                }
                Insertion::Replaced => {
                    tracing::debug!(descriptor = %descriptor, handler_key = %handler_key, "Subscription callback replaced");
                    Vec::new()
                }
            }
        };
        // Bus handlers may subscribe or unsubscribe in turn
        self.inner.monitor.publish(events);

        Subscription {
            registry: Arc::downgrade(&self.inner),
            descriptor_key: key,
            handler_key: handler_key.to_string(),
            active: AtomicBool::new(true),
        }
    }

    /// Record a change this client made itself so its echo is dropped on
    /// every descriptor of the fingerprint's resource
    pub fn note_local_change(&self, fingerprint: &EventFingerprint) {
        self.inner.deduper.record(fingerprint);
    }

    pub fn callback_count(&self, descriptor: &SubscriptionDescriptor) -> usize {
        self.inner.listeners.callback_count(&descriptor.key())
    }

    /// Descriptors with at least one callback
    pub fn descriptor_count(&self) -> usize {
        self.inner.listeners.descriptor_count()
    }

    pub fn descriptors(&self) -> Vec<SubscriptionDescriptor> {
        self.inner.listeners.descriptors()
    }
}

impl RegistryInner {
    fn unsubscribe(&self, key: &str, handler_key: &str) -> bool {
        let events = {
            let _ops = self.ops.lock();
            if !self.listeners.remove(key, handler_key) {
                return false;
            }
            self.monitor.release_deferred(key)
        };
        tracing::debug!(descriptor = %key, handler_key = %handler_key, "Unsubscribed");
        self.monitor.publish(events);
        true
    }
}

/// Handle returned by [`SubscriptionRegistry::subscribe`]
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    registry: Weak<RegistryInner>,
    descriptor_key: String,
    handler_key: String,
    active: AtomicBool,
}

impl Subscription {
    /// Remove this callback; safe to call more than once
    ///
    /// Returns true if this call removed the callback.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        match self.registry.upgrade() {
            Some(registry) => registry.unsubscribe(&self.descriptor_key, &self.handler_key),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn descriptor_key(&self) -> &str {
        &self.descriptor_key
    }

    pub fn handler_key(&self) -> &str {
        &self.handler_key
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("descriptor_key", &self.descriptor_key)
            .field("handler_key", &self.handler_key)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::dedup::DedupConfig;
    use crate::monitor::{ChangeSink, MonitorConfig};
    use crate::provider::memory::MemoryProvider;
    use crate::provider::{BreakerConfig, CapabilityAdapter, ChangeKind, ChannelConfig};
    use std::time::Duration;

    struct Fixture {
        provider: MemoryProvider,
        monitor: ConnectionMonitor,
        registry: SubscriptionRegistry,
    }

    fn fixture() -> Fixture {
        let provider = MemoryProvider::new();
        let bus = Arc::new(EventBus::default());
        let deduper = Arc::new(EventDeduper::new(DedupConfig::default()));
        let adapter = Arc::new(CapabilityAdapter::new(
            Arc::new(provider.clone()),
            None,
            BreakerConfig::default(),
            ChannelConfig::default(),
        ));
        let listeners = Arc::new(ListenerTable::new(Some(Arc::clone(&bus))));
        let sink: Arc<dyn ChangeSink> = listeners.clone();
        let monitor = ConnectionMonitor::new(
            MonitorConfig::default(),
            adapter,
            bus,
            Arc::clone(&deduper),
            sink,
        );
        let registry = SubscriptionRegistry::new(listeners, monitor.clone(), deduper);
        Fixture {
            provider,
            monitor,
            registry,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn jobs() -> SubscriptionDescriptor {
        SubscriptionDescriptor::new("jobs", ChangeKind::Update)
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_descriptor_opens_one_channel() {
        let fx = fixture();
        let a = fx.registry.subscribe(jobs(), |_| {});
        let b = fx.registry.subscribe(jobs(), |_| {});
        settle().await;

        assert_eq!(fx.provider.open_count("realtime:jobs:update"), 1);
        assert_eq!(fx.registry.callback_count(&jobs()), 2);
        assert_eq!(fx.monitor.handle(&jobs().key()).map(|h| h.subscriber_count), Some(2));

        assert!(a.unsubscribe());
        settle().await;
        assert!(fx.provider.is_live("realtime:jobs:update"));

        assert!(b.unsubscribe());
        settle().await;
        assert!(!fx.provider.is_live("realtime:jobs:update"));
        assert_eq!(fx.monitor.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_idempotent() {
        let fx = fixture();
        let a = fx.registry.subscribe(jobs(), |_| {});
        let _b = fx.registry.subscribe(jobs(), |_| {});
        settle().await;

        assert!(a.unsubscribe());
        assert!(!a.unsubscribe());
        assert!(!a.is_active());
        assert_eq!(fx.monitor.handle(&jobs().key()).map(|h| h.subscriber_count), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_handler_key_replaces_without_second_reference() {
        let fx = fixture();
        let first = fx.registry.subscribe_with_key(jobs(), "sidebar", |_| {});
        let _second = fx.registry.subscribe_with_key(jobs(), "sidebar", |_| {});
        settle().await;

        assert_eq!(fx.registry.callback_count(&jobs()), 1);
        assert_eq!(fx.monitor.handle(&jobs().key()).map(|h| h.subscriber_count), Some(1));

        assert!(first.unsubscribe());
        settle().await;
        assert_eq!(fx.registry.descriptor_count(), 0);
        assert!(!fx.provider.is_live("realtime:jobs:update"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_change_echo_is_dropped() {
        let fx = fixture();
        let seen = Arc::new(Mutex::new(0usize));
        let s = Arc::clone(&seen);
        let _sub = fx.registry.subscribe(jobs(), move |_| *s.lock() += 1);
        settle().await;

        let w = Arc::clone(&seen);
        let _wide = fx
            .registry
            .subscribe(SubscriptionDescriptor::new("jobs", ChangeKind::Any), move |_| {
                *w.lock() += 1
            });
        let other = Arc::new(Mutex::new(0usize));
        let o = Arc::clone(&other);
        let _invoices = fx.registry.subscribe(
            SubscriptionDescriptor::new("invoices", ChangeKind::Update),
            move |_| *o.lock() += 1,
        );
        settle().await;

        fx.registry
            .note_local_change(&EventFingerprint::new("jobs", ChangeKind::Update, "7", "t1"));
        let change = ChangePayload::new(ChangeKind::Update, "t1")
            .with_new(serde_json::json!({"id": 7}));
        fx.provider.emit_change("realtime:jobs:update", "jobs", change.clone());
        fx.provider.emit_change("realtime:jobs:all", "jobs", change.clone());
        fx.provider.emit_change("realtime:invoices:update", "invoices", change);
        settle().await;

        // The echo is dropped on both jobs channels; the invoices row is a different change
        assert_eq!(*seen.lock(), 0);
        assert_eq!(*other.lock(), 1);
    }
}
