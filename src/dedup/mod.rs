//! Change Event Deduplication
//!
//! The provider redelivers events after reconnects and echoes our own
//! optimistic writes back to us. Every change notification is reduced to an
//! [`EventFingerprint`] and checked against a short-lived bounded ring.

mod deduper;
mod fingerprint;

pub use deduper::{DedupConfig, EventDeduper};
pub use fingerprint::EventFingerprint;
