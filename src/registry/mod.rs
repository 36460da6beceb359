//! Subscription Registry
//!
//! Logical subscriptions and the callbacks behind them.
//!
//! ## Architecture
//!
//! - `descriptor` - subscription identity, key and channel name
//! - `listeners` - callback sets per descriptor, change fan-out
//! - `subscriptions` - public subscribe/unsubscribe surface

mod descriptor;
mod listeners;
mod subscriptions;

pub use descriptor::SubscriptionDescriptor;
pub use listeners::ChangeCallback;
pub use subscriptions::{Subscription, SubscriptionRegistry};

pub(crate) use listeners::ListenerTable;
