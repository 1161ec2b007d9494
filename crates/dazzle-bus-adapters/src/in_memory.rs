//! In-memory adapter: unit tests and deterministic fixtures.
//!
//! No durability; total order per topic (stricter than the bus contract's
//! minimum of FIFO per `(topic, key)`, which a total order trivially
//! satisfies). A handler is dispatched synchronously from `publish`, so
//! delivery for this adapter never races a background task — useful for
//! assertions that don't want to poll.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dazzle_bus::{
    Bus, ConsumerStatus, Disposition, Handler, NackReason, ReplayFilter, Result as BusResult,
    SubscriptionInfo, TopicInfo,
};
use dazzle_bus::BusError;
use dazzle_schemas::Envelope;
use tokio::sync::Mutex;

struct GroupState {
    handler: Arc<dyn Handler>,
    /// Offset of the next undelivered / unacked event in this topic's log.
    cursor: usize,
    pending_events: i64,
    nacked_events: i64,
    last_processed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct TopicState {
    log: Vec<Envelope>,
    dlq: Vec<Envelope>,
    groups: HashMap<String, GroupState>,
}

/// `tokio::sync::broadcast`-free total-order bus: a `Vec<Envelope>` per
/// topic plays the role of the broadcast log, and each consumer group keeps
/// its own cursor into it.
#[derive(Default)]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, TopicState>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every undelivered log entry to `group`, stopping at the
    /// first retryable nack (the group's cursor parks there so the next
    /// delivery attempt retries the same event — FIFO per topic).
    async fn drain_group(topic: &mut TopicState, group_id: &str) {
        loop {
            let Some(group) = topic.groups.get_mut(group_id) else {
                return;
            };
            let Some(envelope) = topic.log.get(group.cursor).cloned() else {
                return;
            };

            let disposition = group.handler.handle(&envelope).await;
            group.last_processed_at = Some(Utc::now());

            match disposition {
                Disposition::Ack => {
                    group.cursor += 1;
                }
                Disposition::Nack(reason) if reason.retryable => {
                    group.pending_events = (topic.log.len() - group.cursor) as i64;
                    return;
                }
                Disposition::Nack(_reason) => {
                    group.nacked_events += 1;
                    topic.dlq.push(envelope);
                    group.cursor += 1;
                }
            }
        }
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> BusResult<()> {
        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic.to_string()).or_default();
        state.log.push(envelope);

        let group_ids: Vec<String> = state.groups.keys().cloned().collect();
        for group_id in group_ids {
            Self::drain_group(state, &group_id).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn Handler>,
    ) -> BusResult<SubscriptionInfo> {
        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic.to_string()).or_default();
        // New groups begin at the current tail — they do not see history
        // published before they subscribed.
        let tail = state.log.len();
        state.groups.entry(group_id.to_string()).or_insert(GroupState {
            handler,
            cursor: tail,
            pending_events: 0,
            nacked_events: 0,
            last_processed_at: None,
        });

        Ok(SubscriptionInfo {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            last_offset: tail as i64,
        })
    }

    async fn unsubscribe(&self, topic: &str, group_id: &str) -> BusResult<()> {
        let mut topics = self.topics.lock().await;
        if let Some(state) = topics.get_mut(topic) {
            state.groups.remove(group_id);
        }
        Ok(())
    }

    async fn ack(&self, topic: &str, group_id: &str, event_id: &str) -> BusResult<()> {
        let mut topics = self.topics.lock().await;
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| BusError::ConsumerNotFound {
                topic: topic.to_string(),
                group: group_id.to_string(),
            })?;
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| BusError::ConsumerNotFound {
                topic: topic.to_string(),
                group: group_id.to_string(),
            })?;

        if state
            .log
            .get(group.cursor)
            .map(|e| e.event_id.to_string() == event_id)
            .unwrap_or(false)
        {
            group.cursor += 1;
            group.last_processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn nack(
        &self,
        topic: &str,
        group_id: &str,
        event_id: &str,
        reason: NackReason,
    ) -> BusResult<()> {
        let mut topics = self.topics.lock().await;
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| BusError::ConsumerNotFound {
                topic: topic.to_string(),
                group: group_id.to_string(),
            })?;

        let at_cursor = {
            let group = state
                .groups
                .get(group_id)
                .ok_or_else(|| BusError::ConsumerNotFound {
                    topic: topic.to_string(),
                    group: group_id.to_string(),
                })?;
            state
                .log
                .get(group.cursor)
                .map(|e| e.event_id.to_string() == event_id)
                .unwrap_or(false)
        };

        if at_cursor {
            if reason.retryable {
                let group = state.groups.get_mut(group_id).unwrap();
                group.pending_events = (state.log.len() - group.cursor) as i64;
            } else {
                let envelope = state.log[state.groups[group_id].cursor].clone();
                state.dlq.push(envelope);
                let group = state.groups.get_mut(group_id).unwrap();
                group.nacked_events += 1;
                group.cursor += 1;
            }
        }
        Ok(())
    }

    async fn replay(&self, topic: &str, filter: ReplayFilter) -> BusResult<Vec<Envelope>> {
        let topics = self.topics.lock().await;
        let Some(state) = topics.get(topic) else {
            return Ok(Vec::new());
        };

        Ok(state
            .log
            .iter()
            .enumerate()
            .filter(|(idx, envelope)| {
                if let Some(from_ts) = filter.from_ts {
                    if envelope.timestamp < from_ts {
                        return false;
                    }
                }
                if let Some(to_ts) = filter.to_ts {
                    if envelope.timestamp > to_ts {
                        return false;
                    }
                }
                if let Some(from_offset) = filter.from_offset {
                    if (*idx as i64) < from_offset {
                        return false;
                    }
                }
                if let Some(to_offset) = filter.to_offset {
                    if (*idx as i64) > to_offset {
                        return false;
                    }
                }
                if let Some(key) = &filter.key_filter {
                    if &envelope.key != key {
                        return false;
                    }
                }
                true
            })
            .map(|(_, envelope)| envelope.clone())
            .collect())
    }

    async fn get_consumer_status(&self, topic: &str, group_id: &str) -> BusResult<ConsumerStatus> {
        let topics = self.topics.lock().await;
        let state = topics
            .get(topic)
            .ok_or_else(|| BusError::ConsumerNotFound {
                topic: topic.to_string(),
                group: group_id.to_string(),
            })?;
        let group = state
            .groups
            .get(group_id)
            .ok_or_else(|| BusError::ConsumerNotFound {
                topic: topic.to_string(),
                group: group_id.to_string(),
            })?;

        Ok(ConsumerStatus {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            last_offset: group.cursor as i64,
            pending_events: group.pending_events,
            nacked_events: group.nacked_events,
            last_processed_at: group.last_processed_at,
        })
    }

    async fn list_topics(&self) -> BusResult<Vec<String>> {
        let topics = self.topics.lock().await;
        Ok(topics.keys().cloned().collect())
    }

    async fn list_consumer_groups(&self, topic: &str) -> BusResult<Vec<String>> {
        let topics = self.topics.lock().await;
        Ok(topics
            .get(topic)
            .map(|s| s.groups.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_topic_info(&self, topic: &str) -> BusResult<TopicInfo> {
        let topics = self.topics.lock().await;
        let state = topics.get(topic);
        Ok(TopicInfo {
            topic: topic.to_string(),
            consumer_groups: state
                .map(|s| s.groups.keys().cloned().collect())
                .unwrap_or_default(),
            dlq_depth: state.map(|s| s.dlq.len() as i64).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _envelope: &Envelope) -> Disposition {
            self.count.fetch_add(1, Ordering::SeqCst);
            Disposition::Ack
        }
    }

    #[tokio::test]
    async fn publish_then_subscribe_does_not_see_history() {
        let bus = InMemoryBus::new();
        let envelope =
            Envelope::new("orders", "OrderCreated", "O-1", serde_json::json!({}), None).unwrap();
        bus.publish("orders", envelope).await.unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "orders",
            "billing",
            Arc::new(CountingHandler {
                count: count.clone(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn per_key_fifo_delivery_to_subscribed_group() {
        let bus = InMemoryBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "orders",
            "billing",
            Arc::new(CountingHandler {
                count: count.clone(),
            }),
        )
        .await
        .unwrap();

        for i in 0..3 {
            let envelope = Envelope::new(
                "orders",
                "OrderCreated",
                "O-1",
                serde_json::json!({"seq": i}),
                None,
            )
            .unwrap();
            bus.publish("orders", envelope).await.unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    struct AlwaysNackHandler;

    #[async_trait]
    impl Handler for AlwaysNackHandler {
        async fn handle(&self, _envelope: &Envelope) -> Disposition {
            Disposition::Nack(NackReason::permanent("boom", "always fails"))
        }
    }

    #[tokio::test]
    async fn permanent_nack_routes_to_dlq() {
        let bus = InMemoryBus::new();
        bus.subscribe("orders", "billing", Arc::new(AlwaysNackHandler))
            .await
            .unwrap();

        let envelope =
            Envelope::new("orders", "OrderCreated", "O-1", serde_json::json!({}), None).unwrap();
        bus.publish("orders", envelope).await.unwrap();

        let info = bus.get_topic_info("orders").await.unwrap();
        assert_eq!(info.dlq_depth, 1);
    }

    /// Nacks retryable on its very first call, acks every call after.
    struct FlakyHandler {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for FlakyHandler {
        async fn handle(&self, _envelope: &Envelope) -> Disposition {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                Disposition::Nack(NackReason::retryable("try-again", "not ready yet"))
            } else {
                Disposition::Ack
            }
        }
    }

    #[tokio::test]
    async fn retryable_nack_redelivers_the_same_event_until_it_acks() {
        let bus = InMemoryBus::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "orders",
            "billing",
            Arc::new(FlakyHandler {
                attempts: attempts.clone(),
            }),
        )
        .await
        .unwrap();

        let first =
            Envelope::new("orders", "OrderCreated", "O-1", serde_json::json!({}), None).unwrap();
        bus.publish("orders", first).await.unwrap();
        // Nacked retryable on the only delivery attempt so far; cursor parks.
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let status = bus.get_consumer_status("orders", "billing").await.unwrap();
        assert_eq!(status.pending_events, 1);

        // Any later activity on the topic re-drains the group, which retries
        // the parked event (redelivery) before it can move on to the new one.
        let second =
            Envelope::new("orders", "OrderCreated", "O-2", serde_json::json!({}), None).unwrap();
        bus.publish("orders", second).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let status = bus.get_consumer_status("orders", "billing").await.unwrap();
        assert_eq!(status.last_offset, 2);
    }
}
