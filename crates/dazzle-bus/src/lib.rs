//! Abstract event bus: one coherent capability set, many backend adapters.
//!
//! A small trait describes what a bus can do; adapters implement it.
//! Nothing inherits from anything.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dazzle_schemas::Envelope;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no consumer group {group} registered on topic {topic}")]
    ConsumerNotFound { topic: String, group: String },
    #[error("event {event_id} not found on topic {topic}")]
    EventNotFound { topic: String, event_id: String },
    #[error("publish to topic {topic} failed: {message}")]
    Publish { topic: String, message: String },
}

pub type Result<T> = std::result::Result<T, BusError>;

/// `{retryable, category, message}` — why a handler rejected an event.
/// Retryable nacks leave the event pending for re-delivery; non-retryable
/// nacks move the event to `<topic>.dlq`.
#[derive(Debug, Clone)]
pub struct NackReason {
    pub retryable: bool,
    pub category: String,
    pub message: String,
}

impl NackReason {
    pub fn retryable(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            category: category.into(),
            message: message.into(),
        }
    }

    pub fn permanent(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            category: category.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, retryable={})",
            self.message, self.category, self.retryable
        )
    }
}

/// Outcome of handing an envelope to a consumer: a handler is any value
/// supporting `(envelope) -> ack|nack(reason)`; there is no inheritance
/// tree, just this capability set.
#[derive(Debug, Clone)]
pub enum Disposition {
    Ack,
    Nack(NackReason),
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Disposition;
}

/// Registration record returned by `subscribe`.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub topic: String,
    pub group_id: String,
    pub last_offset: i64,
}

#[derive(Debug, Clone)]
pub struct ConsumerStatus {
    pub topic: String,
    pub group_id: String,
    pub last_offset: i64,
    pub pending_events: i64,
    pub nacked_events: i64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TopicInfo {
    pub topic: String,
    pub consumer_groups: Vec<String>,
    pub dlq_depth: i64,
}

/// Filter for `replay`; all fields optional, `None` means unconstrained.
#[derive(Debug, Clone, Default)]
pub struct ReplayFilter {
    pub from_ts: Option<DateTime<Utc>>,
    pub to_ts: Option<DateTime<Utc>>,
    pub from_offset: Option<i64>,
    pub to_offset: Option<i64>,
    pub key_filter: Option<String>,
}

/// The abstract event bus contract every adapter in `dazzle-bus-adapters`
/// implements identically. Delivery is **at-least-once**; ordering is FIFO
/// per `(topic, key)` within a single consumer group. Across keys, delivery
/// may run concurrently.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish directly to the backend. Transactional publication (through
    /// the outbox) is composed by `dazzle-publisher`, not by the bus itself
    /// — the bus only knows how to accept and deliver an envelope.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()>;

    /// Register a consumer group. New groups begin at the current tail
    /// unless the adapter specifies otherwise (see DESIGN.md's Open
    /// Question (a) for the partitioned-log adapter's decision).
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: std::sync::Arc<dyn Handler>,
    ) -> Result<SubscriptionInfo>;

    async fn unsubscribe(&self, topic: &str, group_id: &str) -> Result<()>;

    async fn ack(&self, topic: &str, group_id: &str, event_id: &str) -> Result<()>;

    async fn nack(
        &self,
        topic: &str,
        group_id: &str,
        event_id: &str,
        reason: NackReason,
    ) -> Result<()>;

    /// Lazily replay envelopes matching `filter`. Adapters that can't stream
    /// lazily (e.g. in-memory) may materialize eagerly; callers should not
    /// assume either.
    async fn replay(&self, topic: &str, filter: ReplayFilter) -> Result<Vec<Envelope>>;

    async fn get_consumer_status(&self, topic: &str, group_id: &str) -> Result<ConsumerStatus>;

    async fn list_topics(&self) -> Result<Vec<String>>;

    async fn list_consumer_groups(&self, topic: &str) -> Result<Vec<String>>;

    async fn get_topic_info(&self, topic: &str) -> Result<TopicInfo>;
}
