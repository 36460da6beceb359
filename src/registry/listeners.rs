//! Callback Table
//!
//! Logical subscribers per descriptor. The monitor hands every deduplicated
//! change to [`ListenerTable::deliver`], which fans it out to the callbacks
//! of that descriptor and republishes it on the bus.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::descriptor::SubscriptionDescriptor;
use crate::bus::{panic_message, BusEvent, EventBus};
use crate::monitor::ChangeSink;
use crate::provider::ChangePayload;

/// Subscriber callback for row changes
pub type ChangeCallback = Arc<dyn Fn(&ChangePayload) + Send + Sync>;

struct CallbackSet {
    descriptor: SubscriptionDescriptor,
    callbacks: HashMap<String, ChangeCallback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Insertion {
    /// First callback under this handler key
    Added,
    /// An existing callback was swapped out
    Replaced,
}

pub(crate) struct ListenerTable {
    sets: RwLock<HashMap<String, CallbackSet>>,
    bus: Option<Arc<EventBus>>,
}

impl ListenerTable {
    pub(crate) fn new(bus: Option<Arc<EventBus>>) -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
            bus,
        }
    }

    pub(crate) fn insert(
        &self,
        descriptor: &SubscriptionDescriptor,
        handler_key: &str,
        callback: ChangeCallback,
    ) -> Insertion {
        let mut sets = self.sets.write();
        let set = sets.entry(descriptor.key()).or_insert_with(|| CallbackSet {
            descriptor: descriptor.clone(),
            callbacks: HashMap::new(),
        });

        match set.callbacks.insert(handler_key.to_string(), callback) {
            Some(_) => Insertion::Replaced,
            None => Insertion::Added,
        }
    }

    /// Returns true if a callback was actually removed
    pub(crate) fn remove(&self, key: &str, handler_key: &str) -> bool {
        let mut sets = self.sets.write();
        let Some(set) = sets.get_mut(key) else {
            return false;
        };

        let removed = set.callbacks.remove(handler_key).is_some();
        if set.callbacks.is_empty() {
            sets.remove(key);
        }
        removed
    }

    pub(crate) fn callback_count(&self, key: &str) -> usize {
        self.sets
            .read()
            .get(key)
            .map(|set| set.callbacks.len())
            .unwrap_or(0)
    }

    pub(crate) fn descriptor_count(&self) -> usize {
        self.sets.read().len()
    }

    pub(crate) fn descriptors(&self) -> Vec<SubscriptionDescriptor> {
        self.sets
            .read()
            .values()
            .map(|set| set.descriptor.clone())
            .collect()
    }

    /// Invoke every callback for `key`; returns how many ran without panicking
    pub(crate) fn dispatch(&self, key: &str, change: &ChangePayload) -> usize {
        let callbacks: Vec<(String, ChangeCallback)> = self
            .sets
            .read()
            .get(key)
            .map(|set| {
                set.callbacks
                    .iter()
                    .map(|(k, cb)| (k.clone(), Arc::clone(cb)))
                    .collect()
            })
            .unwrap_or_default();

        let mut delivered = 0;
        for (handler_key, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(change))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    tracing::error!(
                        descriptor = %key,
                        handler_key = %handler_key,
                        panic = %panic_message(panic.as_ref()),
                        "Subscriber callback panicked"
                    );
                }
            }
        }
        delivered
    }
}

impl ChangeSink for ListenerTable {
    fn deliver(&self, key: &str, descriptor: &SubscriptionDescriptor, change: &ChangePayload) {
        let delivered = self.dispatch(key, change);
        tracing::debug!(
            descriptor = %descriptor,
            change_kind = %change.change_kind,
            delivered,
            "Change delivered"
        );

        if let Some(bus) = &self.bus {
            bus.emit(BusEvent::ResourceChanged {
                resource: descriptor.resource().to_string(),
                descriptor: key.to_string(),
                change: change.clone(),
            });
        }
    }
}
