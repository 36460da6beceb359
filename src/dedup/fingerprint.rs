//! Event fingerprints
//!
//! A change notification is identified by its resource, its change kind,
//! the id of the affected entity and the provider's commit timestamp.

use serde::Serialize;
use std::fmt;

use crate::provider::{ChangeKind, ChangePayload};

/// Identity of a single change event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EventFingerprint {
    pub resource: String,
    pub change_kind: ChangeKind,
    pub entity_id: String,
    pub commit_timestamp: String,
}

impl EventFingerprint {
    pub fn new(
        resource: impl Into<String>,
        change_kind: ChangeKind,
        entity_id: impl Into<String>,
        commit_timestamp: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            change_kind,
            entity_id: entity_id.into(),
            commit_timestamp: commit_timestamp.into(),
        }
    }

    /// Derive a fingerprint from a provider payload
    ///
    /// The entity id is read from `id_field` on the new row, falling back to
    /// the old row. Returns `None` when neither row carries the field.
    pub fn from_payload(payload: &ChangePayload, resource: &str, id_field: &str) -> Option<Self> {
        let entity_id = match payload.field(id_field)? {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => return None,
            other => other.to_string(),
        };

        Some(Self::new(
            resource,
            payload.change_kind,
            entity_id,
            payload.commit_timestamp.clone(),
        ))
    }

    /// Single string key used by the deduper
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.resource, self.change_kind, self.entity_id, self.commit_timestamp
        )
    }
}

impl fmt::Display for EventFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_and_string_ids_agree() {
        let numeric = ChangePayload::new(ChangeKind::Update, "T1").with_new(json!({"id": 42}));
        let string = ChangePayload::new(ChangeKind::Update, "T1").with_new(json!({"id": "42"}));

        let a = EventFingerprint::from_payload(&numeric, "jobs", "id").unwrap();
        let b = EventFingerprint::from_payload(&string, "jobs", "id").unwrap();
        assert_eq!(a.key(), "jobs:UPDATE:42:T1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_same_row_id_in_other_resource_differs() {
        let payload = ChangePayload::new(ChangeKind::Update, "T1").with_new(json!({"id": 42}));

        let jobs = EventFingerprint::from_payload(&payload, "jobs", "id").unwrap();
        let invoices = EventFingerprint::from_payload(&payload, "invoices", "id").unwrap();
        assert_ne!(jobs.key(), invoices.key());
    }

    #[test]
    fn test_delete_uses_old_row() {
        let payload = ChangePayload::new(ChangeKind::Delete, "T9").with_old(json!({"id": 3}));
        let fp = EventFingerprint::from_payload(&payload, "jobs", "id").unwrap();
        assert_eq!(fp.entity_id, "3");
    }

    #[test]
    fn test_missing_id_yields_none() {
        let payload = ChangePayload::new(ChangeKind::Insert, "T1").with_new(json!({"name": "x"}));
        assert!(EventFingerprint::from_payload(&payload, "jobs", "id").is_none());

        let null_id = ChangePayload::new(ChangeKind::Insert, "T1").with_new(json!({"id": null}));
        assert!(EventFingerprint::from_payload(&null_id, "jobs", "id").is_none());
    }
}
