//! Tier 0.5 — SQLite-backed bus for local development. Same append-log +
//! per-group-cursor shape as [`crate::relational`], but against a single
//! on-disk file; SQLite serializes writers itself, so there is no
//! `FOR UPDATE SKIP LOCKED` step here — a single writer is the expected
//! deployment shape for this tier (one dev box, not a cluster).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dazzle_bus::{
    Bus, BusError, ConsumerStatus, Disposition, Handler, NackReason, ReplayFilter,
    Result as BusResult, SubscriptionInfo, TopicInfo,
};
use dazzle_schemas::Envelope;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::error;

const DDL: &str = "
create table if not exists bus_events (
    seq         integer primary key autoincrement,
    topic       text not null,
    event_id    text not null,
    envelope    text not null,
    created_at  text not null default (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);
create index if not exists idx_bus_events_topic_seq on bus_events (topic, seq);

create table if not exists bus_consumer_offsets (
    topic       text not null,
    group_id    text not null,
    cursor_seq  integer not null default 0,
    pending_events integer not null default 0,
    nacked_events  integer not null default 0,
    last_processed_at text,
    primary key (topic, group_id)
);

create table if not exists bus_dlq (
    topic       text not null,
    group_id    text not null,
    event_id    text not null,
    envelope    text not null,
    reason      text not null
);
";

pub struct EmbeddedBusConfig {
    pub poll_interval: Duration,
}

impl Default for EmbeddedBusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
        }
    }
}

struct Consumer {
    task: JoinHandle<()>,
}

pub struct EmbeddedBus {
    pool: SqlitePool,
    config: EmbeddedBusConfig,
    consumers: Mutex<HashMap<(String, String), Consumer>>,
}

impl EmbeddedBus {
    pub async fn new(pool: SqlitePool, config: EmbeddedBusConfig) -> sqlx::Result<Self> {
        for stmt in DDL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            config,
            consumers: Mutex::new(HashMap::new()),
        })
    }

    async fn poll_once(pool: &SqlitePool, topic: &str, group_id: &str, handler: &Arc<dyn Handler>) {
        let cursor: Option<(i64,)> =
            sqlx::query_as("select cursor_seq from bus_consumer_offsets where topic = ? and group_id = ?")
                .bind(topic)
                .bind(group_id)
                .fetch_optional(pool)
                .await
                .unwrap_or(None);
        let Some((cursor_seq,)) = cursor else { return };

        let next = sqlx::query(
            "select seq, envelope from bus_events where topic = ? and seq > ? order by seq asc limit 1",
        )
        .bind(topic)
        .bind(cursor_seq)
        .fetch_optional(pool)
        .await;
        let Ok(Some(next)) = next else { return };

        let seq: i64 = next.get("seq");
        let envelope_text: String = next.get("envelope");
        let envelope: Envelope = match serde_json::from_str(&envelope_text) {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "malformed envelope in bus_events, skipping");
                let _ = sqlx::query("update bus_consumer_offsets set cursor_seq = ? where topic = ? and group_id = ?")
                    .bind(seq)
                    .bind(topic)
                    .bind(group_id)
                    .execute(pool)
                    .await;
                return;
            }
        };

        match handler.handle(&envelope).await {
            Disposition::Ack => {
                let _ = sqlx::query(
                    "update bus_consumer_offsets set cursor_seq = ?, last_processed_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') \
                     where topic = ? and group_id = ?",
                )
                .bind(seq)
                .bind(topic)
                .bind(group_id)
                .execute(pool)
                .await;
            }
            Disposition::Nack(reason) if reason.retryable => {
                let _ = sqlx::query(
                    "update bus_consumer_offsets set pending_events = pending_events + 1 where topic = ? and group_id = ?",
                )
                .bind(topic)
                .bind(group_id)
                .execute(pool)
                .await;
            }
            Disposition::Nack(reason) => {
                let _ = sqlx::query(
                    "insert into bus_dlq (topic, group_id, event_id, envelope, reason) values (?, ?, ?, ?, ?)",
                )
                .bind(topic)
                .bind(group_id)
                .bind(envelope.event_id.to_string())
                .bind(&envelope_text)
                .bind(&reason.message)
                .execute(pool)
                .await;
                let _ = sqlx::query(
                    "update bus_consumer_offsets set cursor_seq = ?, nacked_events = nacked_events + 1 \
                     where topic = ? and group_id = ?",
                )
                .bind(seq)
                .bind(topic)
                .bind(group_id)
                .execute(pool)
                .await;
            }
        }
    }
}

#[async_trait]
impl Bus for EmbeddedBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> BusResult<()> {
        let payload = serde_json::to_string(&envelope).map_err(|e| BusError::Publish {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;
        sqlx::query("insert into bus_events (topic, event_id, envelope) values (?, ?, ?)")
            .bind(topic)
            .bind(envelope.event_id.to_string())
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn Handler>,
    ) -> BusResult<SubscriptionInfo> {
        let tail: (i64,) = sqlx::query_as("select coalesce(max(seq), 0) from bus_events where topic = ?")
            .bind(topic)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        sqlx::query(
            "insert or ignore into bus_consumer_offsets (topic, group_id, cursor_seq) values (?, ?, ?)",
        )
        .bind(topic)
        .bind(group_id)
        .bind(tail.0)
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Publish {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;

        let pool = self.pool.clone();
        let poll_interval = self.config.poll_interval;
        let topic_owned = topic.to_string();
        let group_owned = group_id.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                Self::poll_once(&pool, &topic_owned, &group_owned, &handler).await;
            }
        });

        let mut consumers = self.consumers.lock().await;
        if let Some(old) = consumers.insert((topic.to_string(), group_id.to_string()), Consumer { task }) {
            old.task.abort();
        }

        Ok(SubscriptionInfo {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            last_offset: tail.0,
        })
    }

    async fn unsubscribe(&self, topic: &str, group_id: &str) -> BusResult<()> {
        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.remove(&(topic.to_string(), group_id.to_string())) {
            consumer.task.abort();
        }
        Ok(())
    }

    async fn ack(&self, _topic: &str, _group_id: &str, _event_id: &str) -> BusResult<()> {
        Ok(())
    }

    async fn nack(&self, _topic: &str, _group_id: &str, _event_id: &str, _reason: NackReason) -> BusResult<()> {
        Ok(())
    }

    async fn replay(&self, topic: &str, filter: ReplayFilter) -> BusResult<Vec<Envelope>> {
        let rows = sqlx::query("select seq, envelope, created_at from bus_events where topic = ? order by seq asc")
            .bind(topic)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        let mut out = Vec::new();
        for row in rows {
            let seq: i64 = row.get("seq");
            if let Some(from_offset) = filter.from_offset {
                if seq < from_offset {
                    continue;
                }
            }
            if let Some(to_offset) = filter.to_offset {
                if seq > to_offset {
                    continue;
                }
            }
            let envelope_text: String = row.get("envelope");
            let envelope: Envelope = serde_json::from_str(&envelope_text).map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
            if let Some(from_ts) = filter.from_ts {
                if envelope.timestamp < from_ts {
                    continue;
                }
            }
            if let Some(to_ts) = filter.to_ts {
                if envelope.timestamp > to_ts {
                    continue;
                }
            }
            if let Some(key) = &filter.key_filter {
                if &envelope.key != key {
                    continue;
                }
            }
            out.push(envelope);
        }
        Ok(out)
    }

    async fn get_consumer_status(&self, topic: &str, group_id: &str) -> BusResult<ConsumerStatus> {
        let row = sqlx::query(
            "select cursor_seq, pending_events, nacked_events, last_processed_at \
             from bus_consumer_offsets where topic = ? and group_id = ?",
        )
        .bind(topic)
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BusError::Publish {
            topic: topic.to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| BusError::ConsumerNotFound {
            topic: topic.to_string(),
            group: group_id.to_string(),
        })?;

        let last_processed_at: Option<String> = row.get("last_processed_at");
        Ok(ConsumerStatus {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            last_offset: row.get("cursor_seq"),
            pending_events: row.get("pending_events"),
            nacked_events: row.get("nacked_events"),
            last_processed_at: last_processed_at
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc)),
        })
    }

    async fn list_topics(&self) -> BusResult<Vec<String>> {
        let rows = sqlx::query("select distinct topic from bus_events")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BusError::Publish {
                topic: String::new(),
                message: e.to_string(),
            })?;
        Ok(rows.into_iter().map(|r| r.get("topic")).collect())
    }

    async fn list_consumer_groups(&self, topic: &str) -> BusResult<Vec<String>> {
        let rows = sqlx::query("select group_id from bus_consumer_offsets where topic = ?")
            .bind(topic)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        Ok(rows.into_iter().map(|r| r.get("group_id")).collect())
    }

    async fn get_topic_info(&self, topic: &str) -> BusResult<TopicInfo> {
        let groups = self.list_consumer_groups(topic).await?;
        let dlq: (i64,) = sqlx::query_as("select count(*) from bus_dlq where topic = ?")
            .bind(topic)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        Ok(TopicInfo {
            topic: topic.to_string(),
            consumer_groups: groups,
            dlq_depth: dlq.0,
        })
    }
}

impl Drop for EmbeddedBus {
    fn drop(&mut self) {
        if let Ok(consumers) = self.consumers.try_lock() {
            for consumer in consumers.values() {
                consumer.task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    // A single pooled connection so every query hits the same `:memory:`
    // database instead of each acquire spinning up its own.
    async fn make_bus() -> EmbeddedBus {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        EmbeddedBus::new(pool, EmbeddedBusConfig {
            poll_interval: Duration::from_millis(20),
        })
        .await
        .unwrap()
    }

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
    async fn subscribe_does_not_see_history_published_before_it() {
        let bus = make_bus().await;
        let envelope =
            Envelope::new("orders", "OrderCreated", "O-1", serde_json::json!({}), None).unwrap();
        bus.publish("orders", envelope).await.unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "orders",
            "billing",
            Arc::new(CountingHandler { count: count.clone() }),
        )
        .await
        .unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn published_events_are_delivered_in_order_to_a_subscribed_group() {
        let bus = make_bus().await;
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "orders",
            "billing",
            Arc::new(CountingHandler { count: count.clone() }),
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

        sleep(Duration::from_millis(200)).await;
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
    async fn permanent_nack_routes_to_dlq_and_advances_cursor() {
        let bus = make_bus().await;
        bus.subscribe("orders", "billing", Arc::new(AlwaysNackHandler))
            .await
            .unwrap();

        let envelope =
            Envelope::new("orders", "OrderCreated", "O-1", serde_json::json!({}), None).unwrap();
        bus.publish("orders", envelope).await.unwrap();

        sleep(Duration::from_millis(100)).await;
        let info = bus.get_topic_info("orders").await.unwrap();
        assert_eq!(info.dlq_depth, 1);

        let status = bus.get_consumer_status("orders", "billing").await.unwrap();
        assert_eq!(status.nacked_events, 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = make_bus().await;
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "orders",
            "billing",
            Arc::new(CountingHandler { count: count.clone() }),
        )
        .await
        .unwrap();
        bus.unsubscribe("orders", "billing").await.unwrap();

        let envelope =
            Envelope::new("orders", "OrderCreated", "O-1", serde_json::json!({}), None).unwrap();
        bus.publish("orders", envelope).await.unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn replay_filters_by_key() {
        let bus = make_bus().await;
        bus.publish(
            "orders",
            Envelope::new("orders", "OrderCreated", "O-1", serde_json::json!({}), None).unwrap(),
        )
        .await
        .unwrap();
        bus.publish(
            "orders",
            Envelope::new("orders", "OrderCreated", "O-2", serde_json::json!({}), None).unwrap(),
        )
        .await
        .unwrap();

        let replayed = bus
            .replay(
                "orders",
                ReplayFilter {
                    key_filter: Some("O-2".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].key, "O-2");
    }
}
