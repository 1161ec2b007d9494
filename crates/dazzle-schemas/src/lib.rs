//! Wire types shared by every crate in the platform: the `Envelope` record
//! and the canonical-serialization helpers used to derive stable event ids.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

mod canonical;

pub use canonical::canonicalize_json;

/// DAZZLE's namespace for content-derived `event_id`s (`Uuid::new_v5`).
pub const EVENT_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3a, 0x7e, 0x21, 0x6b, 0x5b, 0x0e, 0x4a, 0x0a, 0x9b, 0x9c, 0x3f, 0x1a, 0x4c, 0x9d, 0x61, 0x02,
]);

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("topic must not be empty")]
    EmptyTopic,
    #[error("event_type must not be empty")]
    EmptyEventType,
    #[error("key must not be empty")]
    EmptyKey,
}

/// Self-describing event record; the unit of publish/consume.
///
/// Immutable once constructed: every field is set at `Envelope::new` time.
/// `event_id` is globally unique within a deployment and `(topic, event_id)`
/// is never republished as a new record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub event_id: Uuid,
    pub topic: String,
    pub event_type: String,
    pub key: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub payload: serde_json::Value,
    pub schema_version: String,
}

impl Envelope {
    /// `schema_version` defaults to `"1"` when not otherwise tracked by the
    /// caller; pass an explicit version string via [`Envelope::with_schema_version`].
    pub fn new(
        topic: impl Into<String>,
        event_type: impl Into<String>,
        key: impl Into<String>,
        payload: serde_json::Value,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Self, EnvelopeError> {
        let topic = topic.into();
        let event_type = event_type.into();
        let key = key.into();

        if topic.is_empty() {
            return Err(EnvelopeError::EmptyTopic);
        }
        if event_type.is_empty() {
            return Err(EnvelopeError::EmptyEventType);
        }
        if key.is_empty() {
            return Err(EnvelopeError::EmptyKey);
        }

        Ok(Self {
            event_id: Uuid::new_v4(),
            topic,
            event_type,
            key,
            timestamp: Utc::now(),
            headers: headers.unwrap_or_default(),
            payload,
            schema_version: "1".to_string(),
        })
    }

    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    /// Replace `event_id` with one derived deterministically from the
    /// envelope's canonical content (topic, event_type, key, payload). Two
    /// envelopes with identical content hash to the same id, which is what
    /// lets a caller request an idempotency key derived from content rather
    /// than trusting a random `event_id` across retries.
    pub fn with_content_derived_id(mut self) -> Self {
        self.event_id = content_event_id(&self.topic, &self.event_type, &self.key, &self.payload);
        self
    }

    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn deserialize(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Derive a stable `Uuid` from an envelope's content via canonical JSON +
/// SHA-256, namespaced under [`EVENT_ID_NAMESPACE`].
pub fn content_event_id(
    topic: &str,
    event_type: &str,
    key: &str,
    payload: &serde_json::Value,
) -> Uuid {
    let basis = serde_json::json!({
        "topic": topic,
        "event_type": event_type,
        "key": key,
        "payload": payload,
    });
    let canonical = canonicalize_json(&basis);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    Uuid::new_v5(&EVENT_ID_NAMESPACE, &digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_empty_topic() {
        let err = Envelope::new("", "OrderCreated", "O-1", serde_json::json!({}), None)
            .unwrap_err();
        assert!(matches!(err, EnvelopeError::EmptyTopic));
    }

    #[test]
    fn new_rejects_empty_event_type() {
        let err = Envelope::new("orders", "", "O-1", serde_json::json!({}), None).unwrap_err();
        assert!(matches!(err, EnvelopeError::EmptyEventType));
    }

    #[test]
    fn new_rejects_empty_key() {
        let err =
            Envelope::new("orders", "OrderCreated", "", serde_json::json!({}), None).unwrap_err();
        assert!(matches!(err, EnvelopeError::EmptyKey));
    }

    #[test]
    fn content_derived_id_is_deterministic() {
        let a = Envelope::new(
            "orders",
            "OrderCreated",
            "O-1",
            serde_json::json!({"amount": 100}),
            None,
        )
        .unwrap()
        .with_content_derived_id();
        let b = Envelope::new(
            "orders",
            "OrderCreated",
            "O-1",
            serde_json::json!({"amount": 100}),
            None,
        )
        .unwrap()
        .with_content_derived_id();
        assert_eq!(a.event_id, b.event_id);
    }

    #[test]
    fn content_derived_id_varies_with_payload() {
        let a = Envelope::new(
            "orders",
            "OrderCreated",
            "O-1",
            serde_json::json!({"amount": 100}),
            None,
        )
        .unwrap()
        .with_content_derived_id();
        let b = Envelope::new(
            "orders",
            "OrderCreated",
            "O-1",
            serde_json::json!({"amount": 200}),
            None,
        )
        .unwrap()
        .with_content_derived_id();
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn round_trips_through_json() {
        let e = Envelope::new(
            "orders",
            "OrderCreated",
            "O-1",
            serde_json::json!({"amount": 100}),
            None,
        )
        .unwrap();
        let s = e.serialize().unwrap();
        let back = Envelope::deserialize(&s).unwrap();
        assert_eq!(e, back);
    }
}
