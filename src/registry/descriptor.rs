//! Subscription Descriptors
//!
//! The logical identity of a subscription: resource, change kind and an
//! optional filter expression. Two equal descriptors always map to the same
//! key and the same physical channel name.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::provider::{ChangeKind, ChangeSpec};

/// Reserved resource name of the heartbeat liveness channel
pub(crate) const LIVENESS_RESOURCE: &str = "__liveness";

/// What a UI feature wants to be told about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionDescriptor {
    resource: String,
    change_kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
}

impl SubscriptionDescriptor {
    pub fn new(resource: impl Into<String>, change_kind: ChangeKind) -> Self {
        Self {
            resource: resource.into(),
            change_kind,
            filter: None,
        }
    }

    /// Restrict the subscription with a provider filter (e.g. `status=eq.open`)
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Descriptor of the dedicated heartbeat channel
    pub fn liveness() -> Self {
        Self::new(LIVENESS_RESOURCE, ChangeKind::Any)
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn change_kind(&self) -> ChangeKind {
        self.change_kind
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn is_liveness(&self) -> bool {
        self.resource == LIVENESS_RESOURCE
    }

    /// Registry key: the concatenation of all fields
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.resource,
            self.change_kind,
            self.filter.as_deref().unwrap_or("")
        )
    }

    /// Provider channel name, derived deterministically from the fields
    pub fn channel_name(&self) -> String {
        if self.is_liveness() {
            return "realtime:liveness".to_string();
        }

        let kind = match self.change_kind {
            ChangeKind::Any => "all".to_string(),
            other => other.as_str().to_ascii_lowercase(),
        };
        match &self.filter {
            Some(filter) => format!("realtime:{}:{}:{}", self.resource, kind, filter),
            None => format!("realtime:{}:{}", self.resource, kind),
        }
    }

    pub fn change_spec(&self) -> ChangeSpec {
        ChangeSpec {
            resource: self.resource.clone(),
            change_kind: self.change_kind,
            filter: self.filter.clone(),
        }
    }
}

impl fmt::Display for SubscriptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{} {} [{}]", self.resource, self.change_kind, filter),
            None => write!(f, "{} {}", self.resource, self.change_kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_descriptors_share_key_and_name() {
        let a = SubscriptionDescriptor::new("jobs", ChangeKind::Update);
        let b = SubscriptionDescriptor::new("jobs", ChangeKind::Update);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.channel_name(), "realtime:jobs:update");
        assert_eq!(a.channel_name(), b.channel_name());
    }

    #[test]
    fn test_filter_changes_identity() {
        let plain = SubscriptionDescriptor::new("jobs", ChangeKind::Update);
        let filtered = plain.clone().with_filter("status=eq.open");
        assert_ne!(plain.key(), filtered.key());
        assert_eq!(filtered.key(), "jobs|UPDATE|status=eq.open");
        assert_eq!(
            filtered.channel_name(),
            "realtime:jobs:update:status=eq.open"
        );
    }

    #[test]
    fn test_wildcard_and_liveness_names() {
        let any = SubscriptionDescriptor::new("messages", ChangeKind::Any);
        assert_eq!(any.channel_name(), "realtime:messages:all");
        assert!(!any.is_liveness());

        let liveness = SubscriptionDescriptor::liveness();
        assert!(liveness.is_liveness());
        assert_eq!(liveness.channel_name(), "realtime:liveness");
    }
}
